//! # Seen Ledger
//! Per-source record of item keys already reported, capped with FIFO
//! eviction.
//!
//! Each source keeps keys in insertion order (oldest at the front) plus a
//! hash index for O(1) membership. Both sides share the same `Arc<str>`, so
//! the index costs a pointer per key, not a second copy of the string.
//!
//! On disk the ledger is a JSON object `{ "tag": ["oldest", ..., "newest"] }`
//! and it serializes straight from the deques.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::item::ItemRecord;
use crate::store::Compact;

/// Keys seen for one source, oldest first.
#[derive(Debug, Default, Clone)]
pub struct SourceSeen {
    order: VecDeque<Arc<str>>,
    index: HashSet<Arc<str>>,
}

impl SourceSeen {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    /// Keys oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|k| &**k)
    }

    /// Appends `key` if unseen. Existing keys keep their position.
    fn insert(&mut self, key: &str) -> bool {
        if self.index.contains(key) {
            return false;
        }
        let k: Arc<str> = Arc::from(key);
        self.index.insert(Arc::clone(&k));
        self.order.push_back(k);
        true
    }

    /// Drop oldest keys until `len <= cap`. Returns how many were dropped.
    fn evict_to(&mut self, cap: usize) -> usize {
        let mut evicted = 0;
        while self.order.len() > cap {
            if let Some(old) = self.order.pop_front() {
                self.index.remove(&old);
                evicted += 1;
            }
        }
        evicted
    }

    fn spare_bytes(&self) -> usize {
        let slot = std::mem::size_of::<Arc<str>>();
        (self.order.capacity() - self.order.len()) * slot
            + (self.index.capacity() - self.index.len()) * slot
    }
}

impl Serialize for SourceSeen {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.order.iter().map(|k| &**k))
    }
}

/// Result of absorbing one fetch into the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbsorbOutcome {
    pub inserted: usize,
    pub evicted: usize,
}

/// Source tag → seen keys.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(transparent)]
pub struct SeenLedger {
    sources: BTreeMap<String, SourceSeen>,
}

impl SeenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from ordered lists, e.g. after reading the file. Duplicate keys
    /// keep their first position.
    pub fn from_lists<I, K>(lists: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<K>)>,
        K: AsRef<str>,
    {
        let mut ledger = Self::new();
        for (tag, keys) in lists {
            let entry = ledger.sources.entry(tag).or_default();
            for k in keys {
                entry.insert(k.as_ref());
            }
        }
        ledger
    }

    pub fn contains(&self, tag: &str, key: &str) -> bool {
        self.sources.get(tag).is_some_and(|s| s.contains(key))
    }

    pub fn len(&self, tag: &str) -> usize {
        self.sources.get(tag).map_or(0, SourceSeen::len)
    }

    /// Keys across all sources.
    pub fn total(&self) -> usize {
        self.sources.values().map(SourceSeen::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn source(&self, tag: &str) -> Option<&SourceSeen> {
        self.sources.get(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Keys for `tag`, oldest first.
    pub fn keys(&self, tag: &str) -> Vec<&str> {
        self.sources
            .get(tag)
            .map(|s| s.iter().collect())
            .unwrap_or_default()
    }

    /// Items not yet in the ledger, in fetch order. Repeats inside the batch
    /// are reported once.
    pub fn diff<'a>(&self, tag: &str, items: &'a [ItemRecord]) -> Vec<&'a ItemRecord> {
        let seen = self.sources.get(tag);
        let mut batch: HashSet<&str> = HashSet::with_capacity(items.len());
        items
            .iter()
            .filter(|it| {
                let key = it.key();
                let known = seen.is_some_and(|s| s.contains(key));
                !known && batch.insert(key)
            })
            .collect()
    }

    /// Record `keys` for `tag` and enforce `cap` on that source.
    ///
    /// Older keys go first. Keys from this batch are only evicted when the
    /// batch alone holds more than `cap` new keys; then its latest `cap`
    /// survive.
    pub fn absorb<'k, I>(&mut self, tag: &str, keys: I, cap: usize) -> AbsorbOutcome
    where
        I: IntoIterator<Item = &'k str>,
    {
        let entry = self.sources.entry(tag.to_string()).or_default();
        let mut inserted = 0;
        for k in keys {
            if entry.insert(k) {
                inserted += 1;
            }
        }
        let evicted = entry.evict_to(cap);
        if inserted > cap {
            tracing::warn!(
                target: "store",
                source = %tag,
                inserted,
                cap,
                "single fetch exceeded the per-source cap; earliest keys of the batch were dropped"
            );
        }
        AbsorbOutcome { inserted, evicted }
    }

    /// Apply `cap` to every source. Returns evictions per source (non-zero only).
    pub fn trim(&mut self, cap: usize) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for (tag, seen) in self.sources.iter_mut() {
            let n = seen.evict_to(cap);
            if n > 0 {
                out.insert(tag.clone(), n);
            }
        }
        out
    }

    /// Forget the given sources, or all of them when `tags` is empty.
    /// Returns removed key counts per source that existed.
    pub fn reset(&mut self, tags: &[String]) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        if tags.is_empty() {
            for (tag, seen) in std::mem::take(&mut self.sources) {
                out.insert(tag, seen.len());
            }
            return out;
        }
        for tag in tags {
            if let Some(seen) = self.sources.remove(tag) {
                out.insert(tag.clone(), seen.len());
            }
        }
        out
    }
}

impl Compact for SeenLedger {
    fn compact(&mut self) -> usize {
        let mut released = 0;
        self.sources.retain(|_, s| !s.is_empty());
        for seen in self.sources.values_mut() {
            released += seen.spare_bytes();
            seen.order.shrink_to_fit();
            seen.index.shrink_to_fit();
        }
        released
    }
}

impl<'de> Deserialize<'de> for SeenLedger {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        Ok(Self::from_lists(raw))
    }
}

impl PartialEq for SeenLedger {
    fn eq(&self, other: &Self) -> bool {
        self.sources.len() == other.sources.len()
            && self.sources.iter().all(|(tag, seen)| {
                other
                    .sources
                    .get(tag)
                    .is_some_and(|o| seen.order == o.order)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(tag: &str, keys: &[&str]) -> SeenLedger {
        SeenLedger::from_lists([(tag.to_string(), keys.to_vec())])
    }

    #[test]
    fn fifo_trim_keeps_newest() {
        let mut l = ledger_with("s", &["a", "b", "c", "d", "e"]);
        let evicted = l.trim(3);
        assert_eq!(evicted.get("s"), Some(&2));
        assert_eq!(l.keys("s"), vec!["c", "d", "e"]);
        assert!(!l.contains("s", "a"));
    }

    #[test]
    fn trim_is_idempotent() {
        let mut l = ledger_with("s", &["a", "b", "c"]);
        assert!(l.trim(3).is_empty());
        assert!(l.trim(5).is_empty());
        assert_eq!(l.keys("s"), vec!["a", "b", "c"]);
    }

    #[test]
    fn absorb_evicts_old_before_new() {
        let mut l = ledger_with("s", &["a", "b", "c"]);
        let out = l.absorb("s", ["c", "d"], 3);
        assert_eq!(out, AbsorbOutcome { inserted: 1, evicted: 1 });
        assert_eq!(l.keys("s"), vec!["b", "c", "d"]);
    }

    #[test]
    fn oversized_batch_keeps_latest_keys() {
        let mut l = SeenLedger::new();
        let out = l.absorb("s", ["a", "b", "c", "d"], 2);
        assert_eq!(out.inserted, 4);
        assert_eq!(l.keys("s"), vec!["c", "d"]);
    }

    #[test]
    fn diff_collapses_repeats_and_keeps_order() {
        let l = ledger_with("siteA", &["w1", "w2"]);
        let items: Vec<_> = ["w3", "w1", "w4", "w3"]
            .iter()
            .map(|k| ItemRecord::with_native_id("siteA", k))
            .collect();
        let new: Vec<_> = l.diff("siteA", &items).iter().map(|i| i.key()).collect();
        assert_eq!(new, vec!["w3", "w4"]);
    }

    #[test]
    fn duplicates_in_file_keep_first_position() {
        let l = ledger_with("s", &["a", "b", "a", "c"]);
        assert_eq!(l.keys("s"), vec!["a", "b", "c"]);
    }

    #[test]
    fn reset_selected_and_all() {
        let mut l = SeenLedger::from_lists([
            ("x".to_string(), vec!["1", "2"]),
            ("y".to_string(), vec!["3"]),
        ]);
        let removed = l.reset(&["x".to_string(), "zzz".to_string()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed["x"], 2);
        assert_eq!(l.total(), 1);
        let removed = l.reset(&[]);
        assert_eq!(removed["y"], 1);
        assert!(l.is_empty());
    }

    #[test]
    fn serializes_as_ordered_lists() {
        let l = ledger_with("s", &["b", "a"]);
        let json = serde_json::to_string(&l).unwrap();
        assert_eq!(json, r#"{"s":["b","a"]}"#);
        let back: SeenLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, l);
    }
}
