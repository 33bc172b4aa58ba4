// src/store/mod.rs
//! Persistence for the seen ledger and the cycle history.
//!
//! Writes go to `<file>.tmp` through a buffered writer, are fsynced and then
//! renamed over the previous file, so a crash leaves either the old or the
//! new content on disk. Loading treats a missing file as empty state and a
//! corrupt one as a hard error.

pub mod history;
pub mod ledger;

pub use history::{window_start, CycleSummary, HistoryLog, HistoryStats, MaintenanceKind, SourceStats};
pub use ledger::{AbsorbOutcome, SeenLedger};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::MonitorConfig;
use crate::error::{LoadError, PersistenceError};

/// Stores that can release spare capacity on request.
pub trait Compact {
    /// Shrink internal buffers. Returns an estimate of bytes released.
    fn compact(&mut self) -> usize;
}

#[derive(Debug, Clone)]
pub struct PersistenceStore {
    seen_path: PathBuf,
    history_path: PathBuf,
}

impl PersistenceStore {
    pub fn new(seen_path: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            seen_path: seen_path.into(),
            history_path: history_path.into(),
        }
    }

    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self::new(&cfg.seen_items_file, &cfg.session_history_file)
    }

    pub fn seen_path(&self) -> &Path {
        &self.seen_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Read both stores. Missing files yield empty state.
    pub fn load(&self) -> Result<(SeenLedger, HistoryLog), LoadError> {
        let ledger = self.load_ledger()?;
        let history = self.load_history()?;
        tracing::info!(
            target: "store",
            seen = ledger.total(),
            history = history.len(),
            "state loaded"
        );
        Ok((ledger, history))
    }

    pub fn load_ledger(&self) -> Result<SeenLedger, LoadError> {
        read_json(&self.seen_path)
    }

    pub fn load_history(&self) -> Result<HistoryLog, LoadError> {
        read_json(&self.history_path)
    }

    pub fn save(&self, ledger: &SeenLedger, history: &HistoryLog) -> Result<(), PersistenceError> {
        let ledger_res = self.save_ledger(ledger);
        let history_res = self.save_history(history);
        ledger_res.and(history_res)
    }

    pub fn save_ledger(&self, ledger: &SeenLedger) -> Result<(), PersistenceError> {
        write_json_atomic(&self.seen_path, ledger)?;
        tracing::debug!(target: "store", seen = ledger.total(), "ledger saved");
        Ok(())
    }

    pub fn save_history(&self, history: &HistoryLog) -> Result<(), PersistenceError> {
        write_json_atomic(&self.history_path, history)?;
        tracing::debug!(target: "store", entries = history.len(), "history saved");
        Ok(())
    }

    /// FIFO-trim every source to `max_per_source`. Returns evictions per source.
    pub fn trim_seen_items(ledger: &mut SeenLedger, max_per_source: usize) -> BTreeMap<String, usize> {
        let evicted = ledger.trim(max_per_source);
        for (tag, n) in &evicted {
            tracing::warn!(
                target: "store",
                source = %tag,
                removed = n,
                remaining = ledger.len(tag),
                "trimmed seen items (oldest first)"
            );
        }
        evicted
    }

    /// Drop the oldest history entries beyond `max_entries`.
    pub fn trim_session_history(history: &mut HistoryLog, max_entries: usize) -> usize {
        let before = history.len();
        let evicted = history.trim(max_entries);
        if evicted > 0 {
            tracing::info!(
                target: "store",
                before,
                after = history.len(),
                "trimmed session history"
            );
        }
        evicted
    }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, LoadError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(target: "store", path = %path.display(), "no state file, starting fresh");
            return Ok(T::default());
        }
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let len = file
        .metadata()
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if len == 0 {
        tracing::warn!(target: "store", path = %path.display(), "state file is empty");
        return Ok(T::default());
    }

    serde_json::from_reader(BufReader::new(file)).map_err(|source| {
        if source.is_io() {
            LoadError::Io {
                path: path.to_path_buf(),
                source: source.into(),
            }
        } else {
            LoadError::Corrupt {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = tmp_path(path);
    let res = write_tmp(&tmp, value).and_then(|()| fs::rename(&tmp, path).map_err(WriteFail::Io));
    match res {
        Ok(()) => Ok(()),
        Err(fail) => {
            let _ = fs::remove_file(&tmp);
            Err(match fail {
                WriteFail::Io(source) => io_err(source),
                WriteFail::Serialize(source) => PersistenceError::Serialize {
                    path: path.to_path_buf(),
                    source,
                },
            })
        }
    }
}

enum WriteFail {
    Io(std::io::Error),
    Serialize(serde_json::Error),
}

fn write_tmp<T: Serialize>(tmp: &Path, value: &T) -> Result<(), WriteFail> {
    let file = File::create(tmp).map_err(WriteFail::Io)?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, value).map_err(WriteFail::Serialize)?;
    w.flush().map_err(WriteFail::Io)?;
    let file = w.into_inner().map_err(|e| WriteFail::Io(e.into_error()))?;
    file.sync_all().map_err(WriteFail::Io)
}
