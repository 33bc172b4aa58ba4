// src/fetch/mod.rs
//! Source fetching: the fetcher seam, a registry keyed by source kind and the
//! bounded pool that runs one cycle's fetches.
//!
//! Each source runs in its own task. A source that errors, times out or
//! panics yields an `Err` outcome for that tag only; siblings are unaffected.

pub mod fixture;
pub mod rss;

pub use fixture::FixtureFetcher;
pub use rss::RssFetcher;

use async_trait::async_trait;
use metrics::{counter, histogram};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::{MonitorConfig, SourceConfig, SourceKind};
use crate::error::FetchError;
use crate::item::ItemRecord;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<ItemRecord>, FetchError>;
    fn name(&self) -> &'static str;
}

/// Fetchers by source kind, with optional per-tag overrides.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    by_kind: HashMap<SourceKind, Arc<dyn SourceFetcher>>,
    by_tag: HashMap<String, Arc<dyn SourceFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// RSS over HTTP plus local fixtures.
    pub fn with_defaults(cfg: &MonitorConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(cfg.fetch_timeout())
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self::new()
            .register(SourceKind::Rss, Arc::new(RssFetcher::new(client)))
            .register(SourceKind::Fixture, Arc::new(FixtureFetcher)))
    }

    pub fn register(mut self, kind: SourceKind, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.by_kind.insert(kind, fetcher);
        self
    }

    /// Route one tag to a specific fetcher regardless of its kind.
    pub fn register_tag(mut self, tag: &str, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.by_tag.insert(tag.to_string(), fetcher);
        self
    }

    pub fn resolve(&self, source: &SourceConfig) -> Option<Arc<dyn SourceFetcher>> {
        self.by_tag
            .get(&source.tag)
            .or_else(|| self.by_kind.get(&source.kind))
            .cloned()
    }
}

/// Result of one source's fetch within a cycle.
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub result: Result<Vec<ItemRecord>, FetchError>,
    pub elapsed: Duration,
}

impl SourceOutcome {
    pub fn fetch_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// Runs all fetches of a cycle with at most `concurrency` in flight.
#[derive(Clone)]
pub struct FetchPool {
    registry: Arc<FetcherRegistry>,
    concurrency: usize,
    timeout: Duration,
}

impl FetchPool {
    pub fn new(registry: Arc<FetcherRegistry>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn from_config(registry: Arc<FetcherRegistry>, cfg: &MonitorConfig) -> Self {
        Self::new(registry, cfg.fetch_concurrency, cfg.fetch_timeout())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch every source once. The map has exactly one entry per tag.
    ///
    /// The timeout clock starts when a source gets its slot, not when it is
    /// queued, so a long queue never eats into a source's budget.
    pub async fn fetch_all(&self, sources: &[SourceConfig]) -> BTreeMap<String, SourceOutcome> {
        crate::telemetry::ensure_metrics_described();
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut handles: Vec<(String, JoinHandle<SourceOutcome>)> = Vec::with_capacity(sources.len());
        let mut out = BTreeMap::new();

        for source in sources {
            let tag = source.tag.clone();
            let Some(fetcher) = self.registry.resolve(source) else {
                let outcome = SourceOutcome {
                    result: Err(FetchError::Unsupported(source.kind.to_string())),
                    elapsed: Duration::ZERO,
                };
                record(&tag, &outcome);
                out.insert(tag, outcome);
                continue;
            };

            let slots = Arc::clone(&slots);
            let source = source.clone();
            let timeout = self.timeout;
            let handle = tokio::spawn(async move {
                let _permit = match slots.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return SourceOutcome {
                            result: Err(FetchError::Panicked("fetch pool closed".into())),
                            elapsed: Duration::ZERO,
                        }
                    }
                };
                let t0 = Instant::now();
                let result = match tokio::time::timeout(timeout, fetcher.fetch(&source)).await {
                    Ok(r) => r,
                    Err(_) => Err(FetchError::Timeout(timeout)),
                };
                SourceOutcome {
                    result,
                    elapsed: t0.elapsed(),
                }
            });
            handles.push((tag, handle));
        }

        for (tag, handle) in handles {
            let outcome = match handle.await {
                Ok(o) => o,
                Err(e) => SourceOutcome {
                    result: Err(FetchError::Panicked(e.to_string())),
                    elapsed: Duration::ZERO,
                },
            };
            record(&tag, &outcome);
            out.insert(tag, outcome);
        }
        out
    }
}

fn record(tag: &str, outcome: &SourceOutcome) {
    let ms = outcome.elapsed.as_secs_f64() * 1_000.0;
    histogram!("monitor_fetch_ms", "source" => tag.to_string()).record(ms);
    match &outcome.result {
        Ok(items) => {
            tracing::debug!(target: "fetch", source = %tag, items = items.len(), ms, "fetched");
        }
        Err(e) => {
            counter!("monitor_fetch_errors_total", "kind" => e.kind()).increment(1);
            tracing::warn!(target: "fetch", source = %tag, error = %e, kind = e.kind(), "fetch failed");
        }
    }
}
