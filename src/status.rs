// src/status.rs
//! Read-only HTTP surface: `/health`, `/metrics`, `/history`.
//!
//! Handlers never touch the orchestrator's stores. They read the latest
//! [`StatusSnapshot`] from the watch channel, or the history file on disk.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::memory::Pressure;
use crate::monitor::{Phase, StatusSnapshot};
use crate::store::PersistenceStore;

const DEFAULT_HISTORY_DAYS: u32 = 7;

#[derive(Clone)]
pub struct StatusState {
    pub status: watch::Receiver<StatusSnapshot>,
    pub store: PersistenceStore,
    pub prometheus: Option<PrometheusHandle>,
    /// `/health` reports 503 once the last cycle is older than this.
    pub stale_after: Duration,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/history", get(history))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: StatusState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "monitor", %addr, "status server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthOut {
    pub status: String,
    pub phase: Phase,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub pressure: Pressure,
    pub ledger_items: usize,
    pub history_entries: usize,
}

async fn health(State(state): State<StatusState>) -> Response {
    let snap = state.status.borrow().clone();
    let (code, label) = match snap.last_cycle_at {
        None => (StatusCode::OK, "starting"),
        Some(at) => {
            let age = (Utc::now() - at).to_std().unwrap_or_default();
            if age > state.stale_after {
                (StatusCode::SERVICE_UNAVAILABLE, "stale")
            } else {
                (StatusCode::OK, "ok")
            }
        }
    };
    let out = HealthOut {
        status: label.to_string(),
        phase: snap.phase,
        cycles: snap.cycles,
        last_cycle_at: snap.last_cycle_at,
        pressure: snap.pressure,
        ledger_items: snap.ledger_items,
        history_entries: snap.history_entries,
    };
    (code, Json(out)).into_response()
}

async fn metrics(State(state): State<StatusState>) -> Response {
    match &state.prometheus {
        Some(h) => h.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    days: Option<u32>,
}

async fn history(State(state): State<StatusState>, Query(q): Query<HistoryQuery>) -> Response {
    let days = q.days.unwrap_or(DEFAULT_HISTORY_DAYS);
    let store = state.store.clone();
    let loaded = tokio::task::spawn_blocking(move || store.load_history()).await;
    match loaded {
        Ok(Ok(log)) => Json(log.statistics(days, Utc::now())).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(target: "store", error = %e, "history unreadable");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
