//! In-process LRU cache for object-store `get`/`put` results
//! (spec.md §3 "Object-store LRU cache", §4.C cache policy).
//!
//! Owned by the single-threaded I/O executor; no internal locking
//! (mirrors `hyperion-proxy`'s `cache::BufferedEgress`, which is likewise
//! single-executor-local).

use std::collections::HashMap;

use bytes::Bytes;

/// Fixed per-entry bookkeeping overhead charged against capacity,
/// independent of body size.
const ENTRY_OVERHEAD_BYTES: usize = 128;

#[derive(Debug, Clone)]
pub struct CachedOutcome {
    pub body: Bytes,
    pub metadata: HashMap<String, String>,
}

struct Entry {
    key: (String, String),
    value: CachedOutcome,
}

/// An LRU cache keyed by `(bucket, key)`, bounded by total body bytes plus
/// a fixed per-entry overhead.
pub struct LruCache {
    capacity_bytes: usize,
    used_bytes: usize,
    // Most-recently-used at the back.
    entries: Vec<Entry>,
    index: HashMap<(String, String), usize>,
}

impl LruCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            used_bytes: 0,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn entry_cost(value: &CachedOutcome) -> usize {
        value.body.len() + ENTRY_OVERHEAD_BYTES
    }

    pub fn get(&mut self, bucket: &str, key: &str) -> Option<CachedOutcome> {
        let k = (bucket.to_owned(), key.to_owned());
        let pos = *self.index.get(&k)?;
        let entry = self.entries.remove(pos);
        self.reindex_from(pos);
        let value = entry.value.clone();
        self.entries.push(entry);
        self.index.insert(k, self.entries.len() - 1);
        Some(value)
    }

    pub fn put(&mut self, bucket: &str, key: &str, value: CachedOutcome) {
        let k = (bucket.to_owned(), key.to_owned());
        let cost = Self::entry_cost(&value);

        if let Some(&pos) = self.index.get(&k) {
            let old = self.entries.remove(pos);
            self.used_bytes -= Self::entry_cost(&old.value);
            self.reindex_from(pos);
        }

        self.entries.push(Entry {
            key: k.clone(),
            value,
        });
        self.used_bytes += cost;
        self.index.insert(k, self.entries.len() - 1);

        while self.used_bytes > self.capacity_bytes && !self.entries.is_empty() {
            let evicted = self.entries.remove(0);
            self.used_bytes -= Self::entry_cost(&evicted.value);
            self.index.remove(&evicted.key);
            self.reindex_from(0);
        }
    }

    /// After a removal at `from`, every index at or past `from` shifted
    /// down by one.
    fn reindex_from(&mut self, from: usize) {
        for (i, entry) in self.entries.iter().enumerate().skip(from) {
            self.index.insert(entry.key.clone(), i);
        }
    }

    #[cfg(test)]
    fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(body_len: usize) -> CachedOutcome {
        CachedOutcome {
            body: Bytes::from(vec![0u8; body_len]),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn evicts_from_tail_over_capacity() {
        let mut cache = LruCache::new(ENTRY_OVERHEAD_BYTES * 2 + 20);
        cache.put("b", "a", outcome(10));
        cache.put("b", "b", outcome(10));
        assert!(cache.get("b", "a").is_some());
        cache.put("b", "c", outcome(10));
        // "b" is now least-recently-used and should be evicted to fit "c".
        assert!(cache.get("b", "b").is_none());
        assert!(cache.get("b", "a").is_some());
        assert!(cache.get("b", "c").is_some());
    }

    #[test]
    fn put_existing_key_moves_to_mru_and_replaces_body() {
        let mut cache = LruCache::new(ENTRY_OVERHEAD_BYTES * 3 + 30);
        cache.put("b", "a", outcome(10));
        cache.put("b", "b", outcome(10));
        cache.put("b", "a", outcome(5));
        cache.put("b", "c", outcome(10));
        cache.put("b", "d", outcome(10));
        // "b" should have been evicted first since "a" was refreshed.
        assert!(cache.get("b", "b").is_none());
        assert!(cache.get("b", "a").is_some());
    }

    #[test]
    fn bound_holds_after_many_puts() {
        let mut cache = LruCache::new(500);
        for i in 0..50 {
            cache.put("b", &i.to_string(), outcome(10));
            assert!(cache.used_bytes() <= 500);
        }
    }
}
