use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::slack::batch_text;
use super::Notifier;
use crate::config::SourceConfig;
use crate::error::DeliveryError;
use crate::item::ItemRecord;

const CHANNEL: &str = "email";
const VARS: [&str; 5] = ["SMTP_HOST", "SMTP_USER", "SMTP_PASS", "NOTIFY_EMAIL_FROM", "NOTIFY_EMAIL_TO"];

/// Digest mail per batch over SMTP.
pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailNotifier {
    /// `Ok(None)` when no SMTP variable is set; an error when only some are
    /// or a value does not parse.
    pub fn from_env() -> Result<Option<Self>> {
        let vals: Vec<Option<String>> = VARS
            .iter()
            .map(|v| std::env::var(v).ok().filter(|s| !s.trim().is_empty()))
            .collect();
        if vals.iter().all(Option::is_none) {
            return Ok(None);
        }
        let missing: Vec<&str> = VARS
            .iter()
            .zip(&vals)
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("incomplete SMTP settings, missing {}", missing.join(", "));
        }
        let [host, user, pass, from_addr, to_addr]: [String; 5] = vals
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("SMTP settings changed while reading"))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .context("invalid SMTP_HOST")?
            .credentials(Credentials::new(user, pass))
            .build();
        let from = from_addr.parse().context("invalid NOTIFY_EMAIL_FROM")?;
        let to = to_addr.parse().context("invalid NOTIFY_EMAIL_TO")?;

        Ok(Some(Self { mailer, from, to }))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, source: &SourceConfig, items: &[ItemRecord]) -> Result<usize, DeliveryError> {
        if items.is_empty() {
            return Ok(0);
        }
        let subject = format!("{}: {} new item(s)", source.display_name(), items.len());
        let msg = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(header::ContentType::TEXT_PLAIN)
            .body(batch_text(source, items))
            .map_err(|e| DeliveryError::Request {
                channel: CHANNEL,
                reason: format!("build email: {e}"),
            })?;

        self.mailer.send(msg).await.map_err(|e| DeliveryError::Request {
            channel: CHANNEL,
            reason: e.to_string(),
        })?;
        Ok(items.len())
    }

    fn name(&self) -> &'static str {
        CHANNEL
    }
}
