//! Error taxonomy for the monitor core.
//!
//! Every variant family maps to one recovery point: fetch errors stop at the
//! fetch pool, delivery and persistence errors at the orchestrator, load and
//! config errors at the process boundary.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A single source failed to produce items this cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not parse source payload: {0}")]
    Parse(String),

    #[error("no fetcher registered for source kind {0}")]
    Unsupported(String),

    #[error("fetch task aborted: {0}")]
    Panicked(String),
}

impl FetchError {
    /// Short label used for metrics and history records.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Network { .. } => "network",
            FetchError::Status { .. } => "status",
            FetchError::Timeout(_) => "timeout",
            FetchError::Parse(_) => "parse",
            FetchError::Unsupported(_) => "unsupported",
            FetchError::Panicked(_) => "panicked",
        }
    }
}

/// The notification channel rejected or never received a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("{channel} is not configured")]
    NotConfigured { channel: &'static str },

    #[error("{channel} request failed: {reason}")]
    Request { channel: &'static str, reason: String },

    #[error("{channel} answered with HTTP {status}")]
    Rejected { channel: &'static str, status: u16 },

    #[error("{failed} of {total} deliveries failed")]
    Partial { failed: usize, total: usize },
}

/// Writing state to disk failed. The in-memory copy stays authoritative.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serializing {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// State on disk exists but cannot be trusted. Fatal at startup.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration could not be read or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {var} has invalid value {value:?}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
