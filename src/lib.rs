// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod fetch;
pub mod item;
pub mod memory;
pub mod monitor;
pub mod notify;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod validate;

// ---- Re-exports for stable public API ----
pub use crate::config::{MonitorConfig, SourceConfig, SourceKind};
pub use crate::error::{ConfigError, DeliveryError, FetchError, LoadError, PersistenceError};
pub use crate::item::{ItemId, ItemRecord};
pub use crate::monitor::{Monitor, Phase, StatusSnapshot};
pub use crate::store::{CycleSummary, HistoryLog, PersistenceStore, SeenLedger};
