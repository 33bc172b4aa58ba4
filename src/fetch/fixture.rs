// src/fetch/fixture.rs
//! Local JSON source, used for dry runs and tests.
//!
//! The file holds an array of objects. `id` is optional; without it the key
//! is fingerprinted from title, price and url. Any other fields become
//! attributes.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::fetch::SourceFetcher;
use crate::item::ItemRecord;

#[derive(Debug, Deserialize)]
struct FixtureItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

pub struct FixtureFetcher;

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<ItemRecord>, FetchError> {
        let raw = tokio::fs::read_to_string(&source.location)
            .await
            .map_err(|e| FetchError::Network {
                url: source.location.clone(),
                reason: e.to_string(),
            })?;
        parse_items(&source.tag, &raw)
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

pub fn parse_items(tag: &str, raw: &str) -> Result<Vec<ItemRecord>, FetchError> {
    let items: Vec<FixtureItem> =
        serde_json::from_str(raw).map_err(|e| FetchError::Parse(format!("fixture: {e}")))?;

    Ok(items
        .into_iter()
        .map(|it| {
            let mut rec = match it.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(id) => ItemRecord::with_native_id(tag, id),
                None => ItemRecord::fingerprinted(tag, &it.title, it.price.as_deref(), &it.url),
            };
            rec.set("title", it.title);
            rec.set("url", it.url);
            if let Some(p) = it.price {
                rec.set("price", p);
            }
            for (k, v) in it.extra {
                let text = match v {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => continue,
                    other => other.to_string(),
                };
                rec.set(&k, text);
            }
            rec
        })
        .collect())
}
