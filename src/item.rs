//! # Item records
//! One listing seen on one source, plus the identity rules used for
//! deduplication.
//!
//! Identity is `source tag + key`. The key is the source-native id when the
//! source exposes one, otherwise a fingerprint of the normalized title, price
//! and URL. Attributes never take part in equality.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Hex chars kept from the SHA-256 fingerprint.
const FINGERPRINT_LEN: usize = 32;

/// Composite identity of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    pub source: String,
    pub key: String,
}

impl ItemId {
    pub fn new(source: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    /// Free-form fields: title, url, price, condition, ...
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub discovered_at: DateTime<Utc>,
}

impl ItemRecord {
    /// Record with a source-native id.
    pub fn with_native_id(source: &str, native_id: &str) -> Self {
        Self {
            id: ItemId::new(source, native_id.trim()),
            attributes: BTreeMap::new(),
            discovered_at: Utc::now(),
        }
    }

    /// Record whose key is derived from title, price and url.
    pub fn fingerprinted(source: &str, title: &str, price: Option<&str>, url: &str) -> Self {
        let mut rec = Self {
            id: ItemId::new(source, fingerprint(title, price, url)),
            attributes: BTreeMap::new(),
            discovered_at: Utc::now(),
        };
        rec.set("title", title);
        rec.set("url", url);
        if let Some(p) = price {
            rec.set("price", p);
        }
        rec
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let v = value.into();
        if !v.trim().is_empty() {
            self.attributes.insert(key.to_string(), v);
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn title(&self) -> &str {
        self.attr("title").unwrap_or(&self.id.key)
    }

    pub fn key(&self) -> &str {
        &self.id.key
    }
}

impl PartialEq for ItemRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ItemRecord {}

impl Hash for ItemRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Stable fingerprint over normalized `title | price | url`.
pub fn fingerprint(title: &str, price: Option<&str>, url: &str) -> String {
    let parts = [normalize(title), normalize(price.unwrap_or_default()), normalize(url)];
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("|");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for b in digest.iter().take(FINGERPRINT_LEN / 2) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Lowercase, decode entities, collapse whitespace.
pub fn normalize(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    decoded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
