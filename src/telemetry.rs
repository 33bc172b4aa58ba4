// src/telemetry.rs
//! Tracing subscriber and Prometheus recorder setup.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,reqwest=warn")));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Install the Prometheus recorder. Returns the render handle.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
    ensure_metrics_described();
    Ok(handle)
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("monitor_cycles_total", "Completed poll cycles.");
        describe_counter!("monitor_items_seen_total", "Items returned by fetchers.");
        describe_counter!("monitor_items_new_total", "Items not present in the seen ledger.");
        describe_counter!("monitor_fetch_errors_total", "Failed source fetches by kind.");
        describe_counter!(
            "monitor_delivery_errors_total",
            "Items whose notification could not be delivered."
        );
        describe_counter!("monitor_persist_errors_total", "Failed state file writes.");
        describe_counter!("monitor_maintenance_total", "Maintenance passes by kind.");
        describe_histogram!("monitor_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_histogram!("monitor_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!("monitor_memory_mb", "Resident memory of the process in MB.");
        describe_gauge!("monitor_ledger_items", "Seen keys across all sources.");
        describe_gauge!("monitor_history_entries", "Cycle summaries kept in history.");
        describe_gauge!("monitor_last_cycle_ts", "Unix ts of the last finished cycle.");
    });
}
