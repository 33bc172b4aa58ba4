// src/config/mod.rs
//! Monitor configuration.
//!
//! Read once at startup from TOML, then overridden from the environment.
//! The resulting [`MonitorConfig`] is immutable and shared as
//! `Arc<MonitorConfig>`; nothing reads configuration from globals.

pub mod source;

pub use source::{SourceConfig, SourceKind};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// --- env defaults & names ---
pub const DEFAULT_CONFIG_PATH: &str = "config/monitor.toml";
pub const ENV_CONFIG_PATH: &str = "MONITOR_CONFIG_PATH";
/// Retention longer than a century is treated as a typo.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

const ENV_INTERVAL: &str = "CHECK_INTERVAL_SECONDS";
const ENV_CONCURRENCY: &str = "MAX_CONCURRENT_SCRAPERS";
const ENV_TIMEOUT: &str = "REQUEST_TIMEOUT";
const ENV_MAX_ITEMS: &str = "MAX_SEEN_ITEMS_PER_SITE";
const ENV_MAX_HISTORY: &str = "MAX_SESSION_HISTORY_ENTRIES";
const ENV_RETENTION: &str = "SESSION_HISTORY_RETENTION_DAYS";
const ENV_MEM_WARN: &str = "MEMORY_WARNING_MB";
const ENV_MEM_CRIT: &str = "MEMORY_CRITICAL_MB";
const ENV_MAINT_EVERY: &str = "MAINTENANCE_EVERY_CYCLES";
const ENV_NOTIFY: &str = "ENABLE_NOTIFICATIONS";
const ENV_SEEN_FILE: &str = "SEEN_WATCHES_FILE";
const ENV_HISTORY_FILE: &str = "SESSION_HISTORY_FILE";
const ENV_STATUS_ADDR: &str = "STATUS_ADDR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Ledger file (`{tag: [id, ...]}`).
    pub seen_items_file: PathBuf,
    /// History file (array of cycle summaries).
    pub session_history_file: PathBuf,
    pub check_interval_secs: u64,
    /// Max fetches in flight per cycle.
    pub fetch_concurrency: usize,
    /// Per-source fetch timeout.
    pub fetch_timeout_secs: u64,
    pub max_items_per_source: usize,
    pub max_history_entries: usize,
    /// Age limit for history entries; 0 disables.
    pub history_retention_days: u32,
    pub memory_warning_mb: f64,
    pub memory_critical_mb: f64,
    /// Run periodic maintenance every N cycles.
    pub maintenance_every_cycles: u64,
    /// Fraction of each cap kept by emergency maintenance.
    pub emergency_trim_ratio: f64,
    pub notifications_enabled: bool,
    pub user_agent: String,
    pub status_addr: Option<SocketAddr>,
    #[serde(rename = "source")]
    pub sources: Vec<SourceConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            seen_items_file: PathBuf::from("state/seen_items.json"),
            session_history_file: PathBuf::from("state/session_history.json"),
            check_interval_secs: 300,
            fetch_concurrency: 2,
            fetch_timeout_secs: 15,
            max_items_per_source: 10_000,
            max_history_entries: 1_000,
            history_retention_days: 30,
            memory_warning_mb: 512.0,
            memory_critical_mb: 1024.0,
            maintenance_every_cycles: 10,
            emergency_trim_ratio: 0.5,
            notifications_enabled: true,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) watch-monitor/0.1".to_string(),
            status_addr: None,
            sources: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Parse a TOML file. Does not apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the config file and apply process env overrides:
    /// 1) explicit path (CLI)
    /// 2) $MONITOR_CONFIG_PATH
    /// 3) config/monitor.toml
    /// 4) built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = if let Some(p) = explicit {
            Self::load_from(p)?
        } else if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            Self::load_from(Path::new(&p))?
        } else {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::load_from(default)?
            } else {
                tracing::info!(target: "monitor", "no config file found, using defaults");
                Self::default()
            }
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Apply overrides from any key/value lookup (process env in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, ENV_INTERVAL)? {
            self.check_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_CONCURRENCY)? {
            self.fetch_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_TIMEOUT)? {
            self.fetch_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_ITEMS)? {
            self.max_items_per_source = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAX_HISTORY)? {
            self.max_history_entries = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_RETENTION)? {
            self.history_retention_days = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MEM_WARN)? {
            self.memory_warning_mb = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MEM_CRIT)? {
            self.memory_critical_mb = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MAINT_EVERY)? {
            self.maintenance_every_cycles = v;
        }
        if let Some(raw) = lookup(ENV_NOTIFY) {
            self.notifications_enabled = parse_flag(&raw).ok_or(ConfigError::Env {
                var: ENV_NOTIFY,
                value: raw.clone(),
            })?;
        }
        if let Some(p) = lookup(ENV_SEEN_FILE) {
            self.seen_items_file = PathBuf::from(p);
        }
        if let Some(p) = lookup(ENV_HISTORY_FILE) {
            self.session_history_file = PathBuf::from(p);
        }
        if let Some(v) = parse_var(&lookup, ENV_STATUS_ADDR)? {
            self.status_addr = Some(v);
        }
        Ok(())
    }

    /// Structural checks. Webhook presence is checked separately because a
    /// source without a webhook still gets deduplicated and logged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.check_interval_secs == 0 {
            problems.push("check_interval_secs must be > 0".to_string());
        }
        if self.fetch_concurrency == 0 {
            problems.push("fetch_concurrency must be > 0".to_string());
        }
        if self.fetch_timeout_secs == 0 {
            problems.push("fetch_timeout_secs must be > 0".to_string());
        }
        if self.max_items_per_source == 0 {
            problems.push("max_items_per_source must be > 0".to_string());
        }
        if self.max_history_entries == 0 {
            problems.push("max_history_entries must be > 0".to_string());
        }
        if self.maintenance_every_cycles == 0 {
            problems.push("maintenance_every_cycles must be > 0".to_string());
        }
        if !(self.memory_warning_mb > 0.0 && self.memory_warning_mb < self.memory_critical_mb) {
            problems.push(format!(
                "memory thresholds must satisfy 0 < warning ({}) < critical ({})",
                self.memory_warning_mb, self.memory_critical_mb
            ));
        }
        if self.history_retention_days > MAX_RETENTION_DAYS {
            problems.push(format!(
                "history_retention_days must be <= {MAX_RETENTION_DAYS}, got {}",
                self.history_retention_days
            ));
        }
        if !(self.emergency_trim_ratio > 0.0 && self.emergency_trim_ratio <= 1.0) {
            problems.push(format!(
                "emergency_trim_ratio must be in (0, 1], got {}",
                self.emergency_trim_ratio
            ));
        }

        let mut tags = HashSet::new();
        for s in &self.sources {
            if s.tag.trim().is_empty() {
                problems.push(format!("source {:?} has an empty tag", s.name));
            } else if !tags.insert(s.tag.as_str()) {
                problems.push(format!("duplicate source tag {:?}", s.tag));
            }
            if s.location.trim().is_empty() {
                problems.push(format!("source {:?} has no location", s.tag));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Cap applied by emergency maintenance; never below 1.
    pub fn emergency_floor(&self, cap: usize) -> usize {
        ((cap as f64 * self.emergency_trim_ratio).floor() as usize).max(1)
    }

    /// Sources that are switched on, in declaration order.
    pub fn active_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value: raw }),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
