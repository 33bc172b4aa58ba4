// src/memory.rs
//! Resident memory sampling and pressure classification.
//!
//! The probe is a trait so cycles can be driven against scripted readings;
//! production uses [`ProcessProbe`] backed by `sysinfo`. A probe that cannot
//! read the value returns `None`, which classifies as [`Pressure::Normal`]
//! and never stops a cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::store::Compact;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub trait MemoryProbe: Send + Sync {
    /// Resident set size of this process, if it can be read.
    fn resident_bytes(&self) -> Option<u64>;
}

/// RSS of the current process via `sysinfo`.
pub struct ProcessProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(target: "memory", error = %e, "cannot resolve own pid; memory readings disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        system.process(pid).map(sysinfo::Process::memory)
    }
}

/// Replays a fixed list of readings, then repeats the last one.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    readings: Mutex<VecDeque<Option<f64>>>,
    last: Mutex<Option<f64>>,
}

impl ScriptedProbe {
    /// Readings in MB, consumed one per sample.
    pub fn new(readings_mb: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self {
            readings: Mutex::new(readings_mb.into_iter().collect()),
            last: Mutex::new(None),
        }
    }

    /// Always reports `mb`.
    pub fn fixed(mb: f64) -> Self {
        Self::new([Some(mb)])
    }

    /// Queue more readings.
    pub fn push(&self, mb: Option<f64>) {
        self.readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(mb);
    }
}

impl MemoryProbe for ScriptedProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let next = self
            .readings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let mb = match next {
            Some(v) => {
                *last = v;
                v
            }
            None => *last,
        };
        mb.map(|m| (m * BYTES_PER_MB) as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl Pressure {
    pub fn as_str(self) -> &'static str {
        match self {
            Pressure::Normal => "normal",
            Pressure::Warning => "warning",
            Pressure::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub resident_mb: Option<f64>,
    pub taken_at: DateTime<Utc>,
}

impl MemoryReading {
    /// `self - earlier`, when both are known.
    pub fn delta_since(&self, earlier: &MemoryReading) -> Option<f64> {
        Some(self.resident_mb? - earlier.resident_mb?)
    }
}

/// What a reclaim pass did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReclaimStats {
    pub released_bytes: usize,
    pub before_mb: Option<f64>,
    pub after_mb: Option<f64>,
}

impl ReclaimStats {
    pub fn freed_mb(&self) -> Option<f64> {
        Some(self.before_mb? - self.after_mb?)
    }
}

#[derive(Clone)]
pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    warning_mb: f64,
    critical_mb: f64,
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("warning_mb", &self.warning_mb)
            .field("critical_mb", &self.critical_mb)
            .finish()
    }
}

impl MemoryGovernor {
    pub fn new(probe: Arc<dyn MemoryProbe>, warning_mb: f64, critical_mb: f64) -> Self {
        Self {
            probe,
            warning_mb,
            critical_mb,
        }
    }

    pub fn thresholds(&self) -> (f64, f64) {
        (self.warning_mb, self.critical_mb)
    }

    pub fn sample(&self) -> MemoryReading {
        let resident_mb = self.probe.resident_bytes().map(|b| b as f64 / BYTES_PER_MB);
        if let Some(mb) = resident_mb {
            metrics::gauge!("monitor_memory_mb").set(mb);
        } else {
            tracing::debug!(target: "memory", "resident memory unavailable");
        }
        MemoryReading {
            resident_mb,
            taken_at: Utc::now(),
        }
    }

    /// Thresholds are inclusive: reaching a limit counts as crossing it.
    pub fn classify(&self, reading: &MemoryReading) -> Pressure {
        match reading.resident_mb {
            Some(mb) if mb >= self.critical_mb => Pressure::Critical,
            Some(mb) if mb >= self.warning_mb => Pressure::Warning,
            _ => Pressure::Normal,
        }
    }

    /// Ask every target to release spare capacity, then sample again.
    pub fn reclaim(&self, targets: &mut [&mut dyn Compact]) -> ReclaimStats {
        let before_mb = self.probe.resident_bytes().map(|b| b as f64 / BYTES_PER_MB);
        let released_bytes = targets.iter_mut().map(|t| t.compact()).sum();
        let after = self.sample();
        let stats = ReclaimStats {
            released_bytes,
            before_mb,
            after_mb: after.resident_mb,
        };
        tracing::info!(
            target: "memory",
            released_bytes,
            before_mb = ?stats.before_mb,
            after_mb = ?stats.after_mb,
            "reclaim pass finished"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(probe: ScriptedProbe) -> MemoryGovernor {
        MemoryGovernor::new(Arc::new(probe), 500.0, 800.0)
    }

    #[test]
    fn classify_thresholds_are_inclusive() {
        let g = governor(ScriptedProbe::new([
            Some(100.0),
            Some(500.0),
            Some(799.9),
            Some(800.0),
            None,
        ]));
        let seen: Vec<Pressure> = (0..5).map(|_| g.classify(&g.sample())).collect();
        assert_eq!(
            seen,
            vec![
                Pressure::Normal,
                Pressure::Warning,
                Pressure::Warning,
                Pressure::Critical,
                Pressure::Normal,
            ]
        );
    }

    #[test]
    fn scripted_probe_repeats_last_value() {
        let p = ScriptedProbe::fixed(64.0);
        let a = p.resident_bytes();
        let b = p.resident_bytes();
        assert_eq!(a, b);
        assert_eq!(a, Some(64 * 1024 * 1024));
    }

    #[test]
    fn delta_needs_both_readings() {
        let now = Utc::now();
        let a = MemoryReading { resident_mb: Some(10.0), taken_at: now };
        let b = MemoryReading { resident_mb: Some(12.5), taken_at: now };
        let none = MemoryReading { resident_mb: None, taken_at: now };
        assert_eq!(b.delta_since(&a), Some(2.5));
        assert_eq!(none.delta_since(&a), None);
    }

    #[test]
    fn process_probe_reads_something() {
        assert!(ProcessProbe::new().resident_bytes().is_some());
    }
}
