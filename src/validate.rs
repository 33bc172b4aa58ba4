// src/validate.rs
//! Pre-flight checks for the `validate` command.

use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::config::MonitorConfig;
use crate::fetch::FetcherRegistry;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Structure, fetcher coverage, webhooks and state directory access.
pub fn validate(cfg: &MonitorConfig, registry: &FetcherRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Err(e) = cfg.validate() {
        report.errors.push(e.to_string());
    }
    if cfg.active_sources().next().is_none() {
        report.errors.push("no enabled sources configured".to_string());
    }

    for s in cfg.active_sources() {
        if registry.resolve(s).is_none() {
            report
                .errors
                .push(format!("source {:?}: no fetcher for kind {}", s.tag, s.kind));
        }
        match (&s.webhook_env, s.webhook_url()) {
            (Some(var), None) => report
                .warnings
                .push(format!("source {:?}: webhook variable {var} is not set", s.tag)),
            (None, _) => report
                .warnings
                .push(format!("source {:?}: no webhook configured", s.tag)),
            _ => {}
        }
    }

    for path in [&cfg.seen_items_file, &cfg.session_history_file] {
        if let Err(e) = check_writable(path) {
            report
                .errors
                .push(format!("state file {} is not writable: {e}", path.display()));
        }
    }

    report
}

fn check_writable(path: &Path) -> std::io::Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(d) => d,
        None => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let probe = dir.join(".write_probe");
    fs::write(&probe, b"ok")?;
    fs::remove_file(&probe)
}
