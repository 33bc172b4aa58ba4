// src/notify/mod.rs
//! Delivery of new-item batches.
//!
//! The orchestrator hands each source's new items to one [`Notifier`] as a
//! single batch. Channels are fanned out by [`NotifierMux`]; a channel that
//! fails is logged and never blocks the others.

pub mod discord;
pub mod email;
pub mod slack;

pub use discord::DiscordNotifier;
pub use email::EmailNotifier;
pub use slack::SlackNotifier;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{MonitorConfig, SourceConfig};
use crate::error::DeliveryError;
use crate::item::ItemRecord;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `items` for `source`, in order. Returns how many went out.
    async fn notify(&self, source: &SourceConfig, items: &[ItemRecord]) -> Result<usize, DeliveryError>;
    fn name(&self) -> &'static str;
}

/// Writes new items to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, source: &SourceConfig, items: &[ItemRecord]) -> Result<usize, DeliveryError> {
        for it in items {
            tracing::info!(
                target: "notify",
                source = %source.tag,
                id = %it.id,
                title = it.title(),
                url = it.attr("url").unwrap_or_default(),
                price = it.attr("price").unwrap_or_default(),
                "new item"
            );
        }
        Ok(items.len())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Fan-out over several channels.
///
/// A channel answering `NotConfigured` does not apply to that source. When
/// no channel applies the batch goes to [`LogNotifier`].
#[derive(Clone, Default)]
pub struct NotifierMux {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, n: Arc<dyn Notifier>) -> Self {
        self.channels.push(n);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

#[async_trait]
impl Notifier for NotifierMux {
    /// `Ok(max delivered)` if any channel fully succeeded, otherwise the
    /// error that delivered the most.
    async fn notify(&self, source: &SourceConfig, items: &[ItemRecord]) -> Result<usize, DeliveryError> {
        let mut best_ok: Option<usize> = None;
        let mut best_err: Option<DeliveryError> = None;

        for ch in &self.channels {
            match ch.notify(source, items).await {
                Ok(n) => best_ok = Some(best_ok.map_or(n, |b| b.max(n))),
                Err(DeliveryError::NotConfigured { .. }) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "notify",
                        channel = ch.name(),
                        source = %source.tag,
                        error = %e,
                        "delivery failed"
                    );
                    best_err = Some(match best_err {
                        Some(prev) if delivered(&prev) >= delivered(&e) => prev,
                        _ => e,
                    });
                }
            }
        }

        match (best_ok, best_err) {
            (Some(n), _) => Ok(n),
            (None, Some(e)) => Err(e),
            (None, None) => LogNotifier.notify(source, items).await,
        }
    }

    fn name(&self) -> &'static str {
        "mux"
    }
}

fn delivered(e: &DeliveryError) -> usize {
    match e {
        DeliveryError::Partial { failed, total } => total.saturating_sub(*failed),
        _ => 0,
    }
}

/// Channels from configuration and environment.
///
/// Discord is used for sources that carry a webhook, Slack when
/// `SLACK_WEBHOOK_URL` is set, email when the SMTP variables are complete.
pub fn build_default(cfg: &MonitorConfig) -> anyhow::Result<NotifierMux> {
    let mut mux = NotifierMux::new();

    let discord = DiscordNotifier::from_sources(cfg.active_sources())?;
    if discord.has_webhooks() {
        mux = mux.with(Arc::new(discord));
    }
    if let Some(slack) = SlackNotifier::from_env()? {
        mux = mux.with(Arc::new(slack));
    }
    if let Some(email) = EmailNotifier::from_env()? {
        mux = mux.with(Arc::new(email));
    }

    tracing::info!(target: "notify", channels = ?mux.names(), "notifiers ready");
    Ok(mux)
}
