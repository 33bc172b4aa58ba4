// src/config/source.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which fetcher implementation handles a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// RSS 2.0 feed over HTTP.
    Rss,
    /// Local JSON array of items (dry runs, tests).
    Fixture,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Rss => f.write_str("rss"),
            SourceKind::Fixture => f.write_str("fixture"),
        }
    }
}

/// One polled source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable key used in the ledger and history files.
    pub tag: String,
    #[serde(default)]
    pub name: String,
    pub kind: SourceKind,
    /// URL for `rss`, file path for `fixture`.
    pub location: String,
    /// Env var holding the Discord webhook for this source.
    #[serde(default)]
    pub webhook_env: Option<String>,
    /// Embed color (Discord).
    #[serde(default)]
    pub color: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn new(tag: &str, kind: SourceKind, location: &str) -> Self {
        Self {
            tag: tag.to_string(),
            name: tag.to_string(),
            kind,
            location: location.to_string(),
            webhook_env: None,
            color: None,
            enabled: true,
        }
    }

    /// Human name, falling back to the tag.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.tag
        } else {
            &self.name
        }
    }

    /// Webhook URL from the configured env var, if set and non-empty.
    pub fn webhook_url(&self) -> Option<String> {
        let var = self.webhook_env.as_deref()?;
        std::env::var(var).ok().filter(|v| !v.trim().is_empty())
    }
}
