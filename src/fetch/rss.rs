// src/fetch/rss.rs
use async_trait::async_trait;
use metrics::histogram;
use once_cell::sync::OnceCell;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::{OffsetDateTime, UtcOffset};

use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::fetch::SourceFetcher;
use crate::item::ItemRecord;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text", default)]
    value: String,
}

/// RSS 2.0 over HTTP. The item key is the `<guid>` when present, otherwise a
/// fingerprint of title and link.
pub struct RssFetcher {
    client: reqwest::Client,
}

impl RssFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for RssFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<ItemRecord>, FetchError> {
        let url = source.location.as_str();
        let resp = self.client.get(url).send().await.map_err(|e| {
            tracing::warn!(target: "fetch", error = ?e, source = %source.tag, "rss http error");
            FetchError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.text().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        parse_feed(&source.tag, &body)
    }

    fn name(&self) -> &'static str {
        "rss"
    }
}

/// Parse an RSS document into records for `tag`. Items with neither guid,
/// title nor link are skipped.
pub fn parse_feed(tag: &str, xml: &str) -> Result<Vec<ItemRecord>, FetchError> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(xml);
    let rss: Rss = from_str(&xml_clean).map_err(|e| FetchError::Parse(format!("rss: {e}")))?;

    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let title = it.title.as_deref().map(clean_text).unwrap_or_default();
        let link = it.link.as_deref().map(str::trim).unwrap_or_default().to_string();
        let guid = it
            .guid
            .map(|g| g.value.trim().to_string())
            .filter(|g| !g.is_empty());

        let mut rec = match guid {
            Some(id) => ItemRecord::with_native_id(tag, &id),
            None if !title.is_empty() || !link.is_empty() => {
                ItemRecord::fingerprinted(tag, &title, None, &link)
            }
            None => continue,
        };
        rec.set("title", title);
        rec.set("url", link);
        if let Some(d) = it.description.as_deref() {
            rec.set("description", clean_text(d));
        }
        if let Some(ts) = it.pub_date.as_deref().and_then(rfc2822_to_rfc3339) {
            rec.set("published", ts);
        }
        out.push(rec);
    }

    histogram!("monitor_parse_ms", "source" => tag.to_string())
        .record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(out)
}

fn rfc2822_to_rfc3339(ts: &str) -> Option<String> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC))
        .and_then(|dt| dt.format(&Rfc3339).ok())
}

/// Decode entities, strip tags, collapse whitespace.
fn clean_text(s: &str) -> String {
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));

    let decoded = html_escape::decode_html_entities(s);
    let stripped = re_tags.replace_all(&decoded, " ");
    re_ws.replace_all(&stripped, " ").trim().to_string()
}

// quick-xml only knows the five XML entities; feeds often carry HTML ones.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&euro;", "EUR")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
