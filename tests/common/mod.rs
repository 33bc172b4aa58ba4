// tests/common/mod.rs
//
// Shared test doubles: a scripted fetcher, a recording notifier and config
// builders pointing at a temp dir.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use watch_monitor::config::{MonitorConfig, SourceConfig, SourceKind};
use watch_monitor::error::{DeliveryError, FetchError};
use watch_monitor::fetch::{FetcherRegistry, SourceFetcher};
use watch_monitor::item::ItemRecord;
use watch_monitor::memory::{MemoryProbe, Pressure};
use watch_monitor::monitor::Monitor;
use watch_monitor::notify::Notifier;
use watch_monitor::store::CycleSummary;

pub enum Step {
    Items(Vec<ItemRecord>),
    Fail(FetchError),
    Delay(Duration, Vec<ItemRecord>),
    Panic,
}

/// Replays queued steps per source tag; an empty queue yields no items.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, tag: &str, step: Step) {
        self.scripts
            .lock()
            .entry(tag.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn push_keys(&self, tag: &str, keys: &[&str]) {
        self.push(tag, Step::Items(items(tag, keys)));
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<ItemRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .scripts
            .lock()
            .get_mut(&source.tag)
            .and_then(VecDeque::pop_front);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let res = match step {
            None => Ok(Vec::new()),
            Some(Step::Items(v)) => Ok(v),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Delay(d, v)) => {
                tokio::time::sleep(d).await;
                Ok(v)
            }
            Some(Step::Panic) => panic!("scripted panic for {}", source.tag),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Records every batch; optionally fails after recording.
#[derive(Default)]
pub struct RecordingNotifier {
    batches: Mutex<Vec<(String, Vec<String>)>>,
    fail_with: Mutex<Option<DeliveryError>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(err: DeliveryError) -> Arc<Self> {
        let n = Self::default();
        *n.fail_with.lock() = Some(err);
        Arc::new(n)
    }

    pub fn batches(&self) -> Vec<(String, Vec<String>)> {
        self.batches.lock().clone()
    }

    pub fn keys_for(&self, tag: &str) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .filter(|(t, _)| t == tag)
            .flat_map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, source: &SourceConfig, items: &[ItemRecord]) -> Result<usize, DeliveryError> {
        self.batches.lock().push((
            source.tag.clone(),
            items.iter().map(|i| i.key().to_string()).collect(),
        ));
        match self.fail_with.lock().clone() {
            Some(e) => Err(e),
            None => Ok(items.len()),
        }
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn items(tag: &str, keys: &[&str]) -> Vec<ItemRecord> {
    keys.iter()
        .map(|k| {
            let mut it = ItemRecord::with_native_id(tag, k);
            it.set("title", format!("Watch {k}"));
            it
        })
        .collect()
}

/// Fixture-kind sources writing state into `dir`.
pub fn test_config(dir: &Path, tags: &[&str]) -> MonitorConfig {
    MonitorConfig {
        seen_items_file: dir.join("seen_items.json"),
        session_history_file: dir.join("session_history.json"),
        check_interval_secs: 1,
        fetch_timeout_secs: 5,
        sources: tags
            .iter()
            .map(|t| SourceConfig::new(t, SourceKind::Fixture, "unused.json"))
            .collect(),
        ..MonitorConfig::default()
    }
}

pub fn registry_with(fetcher: Arc<ScriptedFetcher>) -> Arc<FetcherRegistry> {
    Arc::new(FetcherRegistry::new().register(SourceKind::Fixture, fetcher))
}

pub fn build_monitor(
    cfg: MonitorConfig,
    fetcher: Arc<ScriptedFetcher>,
    notifier: Arc<RecordingNotifier>,
    probe: Arc<dyn MemoryProbe>,
) -> Monitor {
    Monitor::new(Arc::new(cfg), registry_with(fetcher), notifier, probe).expect("monitor builds")
}

pub fn summary(cycle: u64, started_at: DateTime<Utc>) -> CycleSummary {
    CycleSummary {
        cycle,
        started_at,
        ended_at: started_at,
        duration_secs: 1.0,
        sources: BTreeMap::new(),
        memory_start_mb: Some(50.0),
        memory_end_mb: Some(50.0),
        memory_delta_mb: Some(0.0),
        pressure: Pressure::Normal,
        maintenance: Vec::new(),
    }
}
