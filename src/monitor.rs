// src/monitor.rs
//! # Cycle orchestrator
//! Drives poll → diff → notify → persist → maintenance, one cycle at a time.
//!
//! The orchestrator is the only owner of the seen ledger and the history
//! log. Fetch tasks hand data back through the pool and never touch shared
//! state, so neither store needs a lock. Status for the HTTP surface is
//! published on a `watch` channel after every phase change.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::config::{MonitorConfig, SourceConfig};
use crate::error::{DeliveryError, LoadError, PersistenceError};
use crate::fetch::{FetchPool, FetcherRegistry};
use crate::item::ItemRecord;
use crate::memory::{MemoryGovernor, MemoryProbe, MemoryReading, Pressure};
use crate::notify::Notifier;
use crate::store::{
    window_start, Compact, CycleSummary, HistoryLog, HistoryStats, MaintenanceKind, PersistenceStore,
    SeenLedger, SourceStats,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
    Notifying,
    Persisting,
    MaintenanceCheck,
    ShuttingDown,
}

/// Read-only view published after each phase change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_summary: Option<CycleSummary>,
    pub ledger_items: usize,
    pub history_entries: usize,
    pub pressure: Pressure,
}

pub struct Monitor {
    cfg: Arc<MonitorConfig>,
    pool: FetchPool,
    notifier: Arc<dyn Notifier>,
    governor: MemoryGovernor,
    store: PersistenceStore,
    ledger: SeenLedger,
    history: HistoryLog,
    cycle: u64,
    status: watch::Sender<StatusSnapshot>,
}

impl Monitor {
    /// Load persisted state and wire the collaborators. A corrupt state file
    /// is returned as an error; the caller must not continue with empty state.
    pub fn new(
        cfg: Arc<MonitorConfig>,
        registry: Arc<FetcherRegistry>,
        notifier: Arc<dyn Notifier>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self, LoadError> {
        crate::telemetry::ensure_metrics_described();

        let store = PersistenceStore::from_config(&cfg);
        let (mut ledger, mut history) = store.load()?;
        // Caps may have been lowered since the files were written.
        PersistenceStore::trim_seen_items(&mut ledger, cfg.max_items_per_source);
        PersistenceStore::trim_session_history(&mut history, cfg.max_history_entries);

        let pool = FetchPool::from_config(registry, &cfg);
        let governor = MemoryGovernor::new(probe, cfg.memory_warning_mb, cfg.memory_critical_mb);
        let (status, _) = watch::channel(StatusSnapshot {
            ledger_items: ledger.total(),
            history_entries: history.len(),
            ..StatusSnapshot::default()
        });

        Ok(Self {
            cfg,
            pool,
            notifier,
            governor,
            store,
            ledger,
            history,
            cycle: 0,
            status,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    pub fn ledger(&self) -> &SeenLedger {
        &self.ledger
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn store(&self) -> &PersistenceStore {
        &self.store
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    fn set_phase(&self, phase: Phase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    /// One poll-diff-notify-persist pass over all enabled sources.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let mem_start = self.governor.sample();

        self.set_phase(Phase::Fetching);
        let sources: Vec<SourceConfig> = self.cfg.active_sources().cloned().collect();
        let outcomes = self.pool.fetch_all(&sources).await;

        self.set_phase(Phase::Notifying);
        let mut per_source = BTreeMap::new();
        for source in &sources {
            let Some(outcome) = outcomes.get(&source.tag) else {
                continue;
            };
            let stats = match &outcome.result {
                Ok(items) => self.process_source(source, items, outcome.fetch_ms()).await,
                Err(e) => SourceStats::failed(e, outcome.fetch_ms()),
            };
            per_source.insert(source.tag.clone(), stats);
        }
        drop(outcomes);

        self.set_phase(Phase::Persisting);
        self.persist_ledger();

        let mem_end = self.governor.sample();
        let pressure = self.governor.classify(&mem_end);
        self.cycle += 1;
        let periodic_due = self.cycle % self.cfg.maintenance_every_cycles.max(1) == 0;

        let mut maintenance = Vec::new();
        if periodic_due {
            maintenance.push(MaintenanceKind::Periodic);
        }
        if pressure == Pressure::Critical {
            maintenance.push(MaintenanceKind::Emergency);
        }

        let summary = CycleSummary {
            cycle: self.cycle,
            started_at,
            ended_at: Utc::now(),
            duration_secs: t0.elapsed().as_secs_f64(),
            sources: per_source,
            memory_start_mb: mem_start.resident_mb,
            memory_end_mb: mem_end.resident_mb,
            memory_delta_mb: mem_end.delta_since(&mem_start),
            pressure,
            maintenance,
        };
        self.history.push(summary.clone(), self.cfg.max_history_entries);
        self.persist_history();

        self.set_phase(Phase::MaintenanceCheck);
        if periodic_due {
            self.periodic_maintenance();
        }
        match pressure {
            Pressure::Critical => self.emergency_maintenance(&mem_end),
            Pressure::Warning => {
                tracing::warn!(
                    target: "memory",
                    severity = "warning",
                    resident_mb = mem_end.resident_mb.unwrap_or_default(),
                    warning_mb = self.cfg.memory_warning_mb,
                    "memory above warning threshold"
                );
            }
            Pressure::Normal => {}
        }

        self.record_cycle(&summary);
        tracing::info!(
            target: "monitor",
            cycle = summary.cycle,
            seen = summary.items_seen(),
            new = summary.items_new(),
            notified = summary.notified(),
            fetch_errors = summary.fetch_errors(),
            secs = summary.duration_secs,
            memory_mb = ?summary.memory_end_mb,
            "cycle finished"
        );
        self.set_phase(Phase::Idle);
        summary
    }

    /// Diff, deliver and absorb one source's fetch.
    async fn process_source(&mut self, source: &SourceConfig, items: &[ItemRecord], fetch_ms: u64) -> SourceStats {
        let fresh: Vec<ItemRecord> = self
            .ledger
            .diff(&source.tag, items)
            .into_iter()
            .cloned()
            .collect();

        let mut stats = SourceStats {
            items_seen: items.len(),
            items_new: fresh.len(),
            fetch_ms,
            ..SourceStats::default()
        };
        counter!("monitor_items_seen_total").increment(items.len() as u64);
        counter!("monitor_items_new_total").increment(fresh.len() as u64);

        if !fresh.is_empty() {
            if self.cfg.notifications_enabled {
                self.deliver(source, &fresh, &mut stats).await;
            } else {
                tracing::info!(target: "notify", source = %source.tag, new = fresh.len(), "notifications disabled");
            }
        }

        // Delivery outcome does not matter here: a failed batch is not retried.
        let absorbed = self.ledger.absorb(
            &source.tag,
            items.iter().map(ItemRecord::key),
            self.cfg.max_items_per_source,
        );
        tracing::debug!(
            target: "monitor",
            source = %source.tag,
            seen = items.len(),
            new = fresh.len(),
            inserted = absorbed.inserted,
            evicted = absorbed.evicted,
            "source processed"
        );
        stats
    }

    async fn deliver(&self, source: &SourceConfig, fresh: &[ItemRecord], stats: &mut SourceStats) {
        let failed = match self.notifier.notify(source, fresh).await {
            Ok(n) => {
                stats.notified = n;
                0
            }
            Err(DeliveryError::Partial { failed, total }) => {
                stats.notified = total.saturating_sub(failed);
                failed
            }
            Err(e) => {
                tracing::warn!(target: "notify", source = %source.tag, error = %e, "batch not delivered");
                fresh.len()
            }
        };
        if failed > 0 {
            stats.delivery_errors = failed as u32;
            counter!("monitor_delivery_errors_total").increment(failed as u64);
        }
    }

    fn persist_ledger(&self) -> bool {
        match self.store.save_ledger(&self.ledger) {
            Ok(()) => true,
            Err(e) => {
                counter!("monitor_persist_errors_total").increment(1);
                tracing::error!(target: "store", error = %e, "ledger save failed; keeping in-memory state");
                false
            }
        }
    }

    fn persist_history(&self) -> bool {
        match self.store.save_history(&self.history) {
            Ok(()) => true,
            Err(e) => {
                counter!("monitor_persist_errors_total").increment(1);
                tracing::error!(target: "store", error = %e, "history save failed; keeping in-memory state");
                false
            }
        }
    }

    /// Enforce caps and retention, then ask the governor to reclaim.
    fn periodic_maintenance(&mut self) {
        counter!("monitor_maintenance_total", "kind" => "periodic").increment(1);
        let evicted = PersistenceStore::trim_seen_items(&mut self.ledger, self.cfg.max_items_per_source);
        let mut dropped = PersistenceStore::trim_session_history(&mut self.history, self.cfg.max_history_entries);
        let retention = self.cfg.history_retention_days;
        if let Some(cutoff) = (retention > 0).then(|| window_start(Utc::now(), retention)).flatten() {
            let expired = self.history.expire_before(cutoff);
            if expired > 0 {
                tracing::info!(target: "store", expired, days = self.cfg.history_retention_days, "expired old history");
            }
            dropped += expired;
        }

        let stats = self.governor.reclaim(&mut [
            &mut self.ledger as &mut dyn Compact,
            &mut self.history as &mut dyn Compact,
        ]);
        tracing::info!(
            target: "monitor",
            cycle = self.cycle,
            ledger_evicted = evicted.values().sum::<usize>(),
            history_dropped = dropped,
            released_bytes = stats.released_bytes,
            "periodic maintenance"
        );

        if !evicted.is_empty() {
            self.persist_ledger();
        }
        if dropped > 0 {
            self.persist_history();
        }
    }

    /// Cut every store to its emergency floor and persist both.
    fn emergency_maintenance(&mut self, reading: &MemoryReading) {
        counter!("monitor_maintenance_total", "kind" => "emergency").increment(1);
        let ledger_floor = self.cfg.emergency_floor(self.cfg.max_items_per_source);
        let history_floor = self.cfg.emergency_floor(self.cfg.max_history_entries);

        tracing::error!(
            target: "memory",
            severity = "critical",
            resident_mb = reading.resident_mb.unwrap_or_default(),
            critical_mb = self.cfg.memory_critical_mb,
            ledger_floor,
            history_floor,
            "critical memory pressure, running emergency maintenance"
        );

        let evicted = PersistenceStore::trim_seen_items(&mut self.ledger, ledger_floor);
        let dropped = PersistenceStore::trim_session_history(&mut self.history, history_floor);
        let stats = self.governor.reclaim(&mut [
            &mut self.ledger as &mut dyn Compact,
            &mut self.history as &mut dyn Compact,
        ]);
        tracing::warn!(
            target: "monitor",
            ledger_evicted = evicted.values().sum::<usize>(),
            history_dropped = dropped,
            freed_mb = ?stats.freed_mb(),
            "emergency maintenance done"
        );

        self.persist_ledger();
        self.persist_history();
    }

    fn record_cycle(&self, summary: &CycleSummary) {
        counter!("monitor_cycles_total").increment(1);
        gauge!("monitor_ledger_items").set(self.ledger.total() as f64);
        gauge!("monitor_history_entries").set(self.history.len() as f64);
        gauge!("monitor_last_cycle_ts").set(summary.ended_at.timestamp() as f64);

        let snapshot = StatusSnapshot {
            phase: Phase::MaintenanceCheck,
            cycles: self.cycle,
            last_cycle_at: Some(summary.ended_at),
            last_summary: Some(summary.clone()),
            ledger_items: self.ledger.total(),
            history_entries: self.history.len(),
            pressure: summary.pressure,
        };
        self.status.send_replace(snapshot);
    }

    /// Run cycles until `stop` flips to `true` (or its sender goes away).
    ///
    /// The stop signal is checked between cycles only; a running cycle always
    /// completes its persistence first. Returns the number of cycles run.
    pub async fn run_continuous(&mut self, mut stop: watch::Receiver<bool>) -> u64 {
        let interval = self.cfg.check_interval();
        let mut ran = 0u64;
        tracing::info!(
            target: "monitor",
            interval_secs = interval.as_secs(),
            sources = self.cfg.active_sources().count(),
            "continuous monitoring started"
        );

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            self.run_cycle().await;
            ran += 1;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        tracing::info!(target: "monitor", "stop handle dropped");
                        break;
                    }
                }
            }
        }

        self.shutdown();
        ran
    }

    /// Final flush of both stores.
    pub fn shutdown(&mut self) {
        self.set_phase(Phase::ShuttingDown);
        let ok = self.persist_ledger() & self.persist_history();
        tracing::info!(target: "monitor", cycles = self.cycle, saved = ok, "monitor stopped");
    }

    /// Forget seen keys for `tags` (all when empty) and persist.
    pub fn reset_seen(&mut self, tags: &[String]) -> Result<BTreeMap<String, usize>, PersistenceError> {
        let removed = self.ledger.reset(tags);
        for (tag, n) in &removed {
            tracing::info!(target: "store", source = %tag, removed = n, "seen items reset");
        }
        self.store.save_ledger(&self.ledger)?;
        self.status.send_modify(|s| s.ledger_items = self.ledger.total());
        Ok(removed)
    }

    pub fn statistics(&self, days: u32) -> HistoryStats {
        self.history.statistics(days, Utc::now())
    }
}
