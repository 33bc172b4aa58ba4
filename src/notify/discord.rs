use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use super::Notifier;
use crate::config::SourceConfig;
use crate::error::DeliveryError;
use crate::item::ItemRecord;

const CHANNEL: &str = "discord";
const DEFAULT_COLOR: u32 = 0x2F_4F_4F;
const MAX_TITLE: usize = 250;
/// Fallback wait when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);
/// Longest rate-limit wait honored inside a cycle.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct Route {
    webhook: String,
    color: u32,
}

/// One embed per item, posted to the source's webhook.
#[derive(Clone)]
pub struct DiscordNotifier {
    routes: HashMap<String, Route>,
    client: Client,
    timeout: Duration,
    max_retries: u8,
    pause: Duration,
}

impl DiscordNotifier {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            client: Client::new(),
            timeout: Duration::from_secs(15),
            max_retries: 3,
            pause: Duration::from_secs(1),
        }
    }

    /// Routes for every source whose `webhook_env` resolves to a URL.
    pub fn from_sources<'a>(sources: impl Iterator<Item = &'a SourceConfig>) -> anyhow::Result<Self> {
        let mut n = Self::new();
        for s in sources {
            match s.webhook_url() {
                Some(url) => n = n.with_webhook(&s.tag, url, s.color),
                None if s.webhook_env.is_some() => {
                    tracing::warn!(
                        target: "notify",
                        source = %s.tag,
                        var = s.webhook_env.as_deref().unwrap_or_default(),
                        "webhook env var not set"
                    );
                }
                None => {}
            }
        }
        Ok(n)
    }

    pub fn with_webhook(mut self, tag: &str, url: String, color: Option<u32>) -> Self {
        self.routes.insert(
            tag.to_string(),
            Route {
                webhook: url,
                color: color.unwrap_or(DEFAULT_COLOR),
            },
        );
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Gap between consecutive items of one batch.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn has_webhooks(&self) -> bool {
        !self.routes.is_empty()
    }

    async fn post(&self, webhook: &str, payload: &DiscordWebhookPayload) -> Result<(), DeliveryError> {
        let mut attempt: u8 = 0;
        let mut rate_limited_once = false;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(webhook)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            match res {
                Ok(rsp) if rsp.status().is_success() => return Ok(()),
                Ok(rsp) if rsp.status() == StatusCode::TOO_MANY_REQUESTS && !rate_limited_once => {
                    // Honored once per item; a second 429 goes through normal backoff.
                    rate_limited_once = true;
                    let wait = retry_after(rsp.headers());
                    tracing::warn!(target: "notify", wait_ms = wait.as_millis() as u64, "discord rate limit");
                    tokio::time::sleep(wait).await;
                }
                Ok(rsp) => {
                    let status = rsp.status().as_u16();
                    if attempt >= self.max_retries {
                        return Err(DeliveryError::Rejected { channel: CHANNEL, status });
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(DeliveryError::Request {
                            channel: CHANNEL,
                            reason: e.to_string(),
                        });
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

impl Default for DiscordNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, source: &SourceConfig, items: &[ItemRecord]) -> Result<usize, DeliveryError> {
        let Some(route) = self.routes.get(&source.tag) else {
            return Err(DeliveryError::NotConfigured { channel: CHANNEL });
        };

        let mut sent = 0usize;
        let mut last_err = None;
        for (i, item) in items.iter().enumerate() {
            let payload = DiscordWebhookPayload::for_item(source, item, route.color);
            match self.post(&route.webhook, &payload).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(target: "notify", source = %source.tag, id = %item.id, error = %e, "discord item failed");
                    last_err = Some(e);
                }
            }
            if i + 1 < items.len() && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        tracing::info!(target: "notify", source = %source.tag, sent, total = items.len(), "discord batch done");
        match last_err {
            None => Ok(sent),
            Some(e) if sent == 0 => Err(e),
            Some(_) => Err(DeliveryError::Partial {
                failed: items.len() - sent,
                total: items.len(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        CHANNEL
    }
}

fn backoff(attempt: u8) -> Duration {
    Duration::from_millis(500u64 << (attempt.saturating_sub(1)).min(6))
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    ["retry-after", "x-ratelimit-reset-after"]
        .iter()
        .filter_map(|h| headers.get(*h))
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .find_map(|s| Duration::try_from_secs_f64(s).ok())
        .map_or(DEFAULT_RETRY_AFTER, |d| d.min(MAX_RETRY_AFTER))
}

#[derive(Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Serialize)]
struct EmbedFooter {
    text: String,
}

#[derive(Serialize)]
struct EmbedImage {
    url: String,
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    color: u32,
    fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EmbedImage>,
    footer: EmbedFooter,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn for_item(source: &SourceConfig, item: &ItemRecord, color: u32) -> Self {
        let mut title: String = item.title().chars().take(MAX_TITLE).collect();
        if item.title().chars().count() > MAX_TITLE {
            title.push_str("...");
        }

        let mut fields = vec![EmbedField {
            name: "Price".to_string(),
            value: format!("**{}**", item.attr("price").unwrap_or("?")),
            inline: false,
        }];
        for (key, label) in [("reference", "Reference"), ("year", "Year"), ("condition", "Condition")] {
            if let Some(v) = item.attr(key) {
                fields.push(EmbedField {
                    name: label.to_string(),
                    value: format!("**{v}**"),
                    inline: key != "reference",
                });
            }
        }

        Self {
            embeds: vec![DiscordEmbed {
                title,
                url: item.attr("url").map(str::to_string),
                color,
                fields,
                image: item.attr("image_url").map(|u| EmbedImage { url: u.to_string() }),
                footer: EmbedFooter {
                    text: format!(
                        "{} - Detected: {}",
                        source.display_name(),
                        item.discovered_at.format("%Y-%m-%d %H:%M:%S")
                    ),
                },
            }],
        }
    }
}
