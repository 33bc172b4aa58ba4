use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::Notifier;
use crate::config::SourceConfig;
use crate::error::DeliveryError;
use crate::item::ItemRecord;

const CHANNEL: &str = "slack";

/// One message per batch to a single incoming webhook.
pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
    timeout: Duration,
}

impl SlackNotifier {
    /// `None` when `SLACK_WEBHOOK_URL` is unset or blank.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        Ok(std::env::var("SLACK_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .map(Self::new))
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

pub(crate) fn batch_text(source: &SourceConfig, items: &[ItemRecord]) -> String {
    let mut text = format!("*{}*: {} new item(s)", source.display_name(), items.len());
    for it in items {
        text.push_str("\n• ");
        match it.attr("url") {
            Some(url) => text.push_str(&format!("<{}|{}>", url, it.title())),
            None => text.push_str(it.title()),
        }
        if let Some(p) = it.attr("price") {
            text.push_str(&format!(" ({p})"));
        }
    }
    text
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, source: &SourceConfig, items: &[ItemRecord]) -> Result<usize, DeliveryError> {
        if items.is_empty() {
            return Ok(0);
        }
        let body = serde_json::json!({ "text": batch_text(source, items) });

        let rsp = self
            .client
            .post(&self.webhook_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Request {
                channel: CHANNEL,
                reason: e.to_string(),
            })?;
        if !rsp.status().is_success() {
            return Err(DeliveryError::Rejected {
                channel: CHANNEL,
                status: rsp.status().as_u16(),
            });
        }
        Ok(items.len())
    }

    fn name(&self) -> &'static str {
        CHANNEL
    }
}
