//! history.rs: capped log of per-cycle summaries.
//!
//! Appends go to the back; trimming always removes from the front, so the
//! surviving entries keep their relative order. Serializes as a plain JSON
//! array straight from the deque.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::error::FetchError;
use crate::memory::Pressure;
use crate::store::Compact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceKind {
    Periodic,
    Emergency,
}

/// Counters for one source within one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub items_seen: usize,
    pub items_new: usize,
    pub notified: usize,
    pub fetch_errors: u32,
    pub delivery_errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub fetch_ms: u64,
}

impl SourceStats {
    pub fn failed(err: &FetchError, fetch_ms: u64) -> Self {
        Self {
            fetch_errors: 1,
            error: Some(err.to_string()),
            fetch_ms,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceStats>,
    pub memory_start_mb: Option<f64>,
    pub memory_end_mb: Option<f64>,
    pub memory_delta_mb: Option<f64>,
    #[serde(default)]
    pub pressure: Pressure,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintenance: Vec<MaintenanceKind>,
}

impl CycleSummary {
    pub fn items_seen(&self) -> usize {
        self.sources.values().map(|s| s.items_seen).sum()
    }

    pub fn items_new(&self) -> usize {
        self.sources.values().map(|s| s.items_new).sum()
    }

    pub fn notified(&self) -> usize {
        self.sources.values().map(|s| s.notified).sum()
    }

    pub fn fetch_errors(&self) -> u32 {
        self.sources.values().map(|s| s.fetch_errors).sum()
    }

    pub fn delivery_errors(&self) -> u32 {
        self.sources.values().map(|s| s.delivery_errors).sum()
    }

    pub fn had_maintenance(&self, kind: MaintenanceKind) -> bool {
        self.maintenance.contains(&kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryLog {
    entries: VecDeque<CycleSummary>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CycleSummary> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&CycleSummary> {
        self.entries.back()
    }

    /// Append, then enforce `cap`. Returns entries dropped.
    pub fn push(&mut self, summary: CycleSummary, cap: usize) -> usize {
        self.entries.push_back(summary);
        self.trim(cap)
    }

    /// Drop oldest entries until `len <= cap`.
    pub fn trim(&mut self, cap: usize) -> usize {
        let excess = self.entries.len().saturating_sub(cap);
        self.entries.drain(..excess);
        excess
    }

    /// Drop entries that started before `cutoff`.
    pub fn expire_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.started_at >= cutoff);
        before - self.entries.len()
    }

    /// Most recent `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<CycleSummary> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(start).cloned().collect()
    }

    /// Aggregate over cycles started within the last `days` days.
    pub fn statistics(&self, days: u32, now: DateTime<Utc>) -> HistoryStats {
        let cutoff = window_start(now, days);
        let mut stats = HistoryStats {
            period_days: days,
            ..HistoryStats::default()
        };
        let mut clean_cycles = 0usize;
        let mut duration_sum = 0.0f64;

        for e in self.entries.iter().filter(|e| cutoff.map_or(true, |c| e.started_at >= c)) {
            stats.total_cycles += 1;
            stats.total_items_seen += e.items_seen();
            stats.total_new_items += e.items_new();
            stats.total_notifications += e.notified();
            stats.total_fetch_errors += e.fetch_errors() as usize;
            stats.total_delivery_errors += e.delivery_errors() as usize;
            duration_sum += e.duration_secs;
            if e.fetch_errors() == 0 {
                clean_cycles += 1;
            }
            if e.had_maintenance(MaintenanceKind::Emergency) {
                stats.emergency_maintenances += 1;
            }

            for (tag, s) in &e.sources {
                let t = stats.per_source.entry(tag.clone()).or_default();
                t.cycles += 1;
                t.items_seen += s.items_seen;
                t.items_new += s.items_new;
                t.fetch_errors += s.fetch_errors as usize;
                if s.fetch_errors == 0 {
                    t.clean_cycles += 1;
                }
            }
        }

        if stats.total_cycles > 0 {
            let n = stats.total_cycles as f64;
            stats.success_rate = clean_cycles as f64 / n * 100.0;
            stats.average_duration_secs = duration_sum / n;
        }
        for t in stats.per_source.values_mut() {
            if t.cycles > 0 {
                t.success_rate = t.clean_cycles as f64 / t.cycles as f64 * 100.0;
            }
        }
        stats
    }
}

/// Start of a `days`-long window ending at `now`. `None` when the window
/// reaches past the earliest representable instant, so everything is inside.
pub fn window_start(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    ChronoDuration::try_days(i64::from(days)).and_then(|d| now.checked_sub_signed(d))
}

impl Compact for HistoryLog {
    fn compact(&mut self) -> usize {
        let spare = self.entries.capacity() - self.entries.len();
        self.entries.shrink_to_fit();
        spare * std::mem::size_of::<CycleSummary>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceTotals {
    pub cycles: usize,
    pub clean_cycles: usize,
    pub items_seen: usize,
    pub items_new: usize,
    pub fetch_errors: usize,
    pub success_rate: f64,
}

/// Window statistics for the `stats` command and the status server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub period_days: u32,
    pub total_cycles: usize,
    pub total_items_seen: usize,
    pub total_new_items: usize,
    pub total_notifications: usize,
    pub total_fetch_errors: usize,
    pub total_delivery_errors: usize,
    pub emergency_maintenances: usize,
    /// Percent of cycles without any fetch error.
    pub success_rate: f64,
    pub average_duration_secs: f64,
    pub per_source: BTreeMap<String, SourceTotals>,
}
