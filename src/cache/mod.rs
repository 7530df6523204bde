//! Cache (C2)
//!
//! An in-process TTL cache for hot lookups: lineup snapshot, EPG now/next,
//! the discovery document, and compiled metadata shells. Grounded in the
//! same DashMap-backed concurrent map style used by the session registry,
//! and in the ETag/If-None-Match pattern the Plex Protocol Surface already
//! applies to the EPG XML response.

use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const TTL_LINEUP: Duration = Duration::from_secs(30);
pub const TTL_EPG_NOW_NEXT: Duration = Duration::from_secs(60);
pub const TTL_DISCOVERY: Duration = Duration::from_secs(300);
pub const TTL_METADATA_SHELL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct Entry {
    value: String,
    etag: String,
    stored_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }

    /// A hard ceiling past which a stale value must never be served, even
    /// under stale-while-revalidate.
    fn is_expired_hard(&self) -> bool {
        self.stored_at.elapsed() > self.ttl * 10
    }
}

pub struct CachedValue {
    pub value: String,
    pub etag: String,
    pub stale: bool,
}

/// Keyed TTL cache with an LRU-ish hard byte cap and stale-while-revalidate.
///
/// Eviction is approximate: entries are only dropped when the cache is over
/// its byte budget, scanning for the oldest `stored_at` first. This keeps the
/// hot path lock-free (DashMap shards) at the cost of an occasional full scan
/// on write, which is acceptable given the cache holds at most a few hundred
/// entries (one per channel, plus a handful of singleton documents).
pub struct Cache {
    entries: DashMap<String, Entry>,
    max_bytes: usize,
}

impl Cache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_bytes,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let entry = self.entries.get(key)?;
        if entry.is_expired_hard() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(CachedValue {
            value: entry.value.clone(),
            etag: entry.etag.clone(),
            stale: !entry.is_fresh(),
        })
    }

    /// Serve a stale value only if present and not past the hard ceiling;
    /// never serve anything once `is_expired_hard` is true.
    pub fn get_stale_while_revalidate(&self, key: &str) -> Option<CachedValue> {
        self.get(key)
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>, etag: impl Into<String>, ttl: Duration) {
        let key = key.into();
        self.entries.insert(
            key,
            Entry {
                value: value.into(),
                etag: etag.into(),
                stored_at: Instant::now(),
                ttl,
            },
        );
        self.evict_if_over_budget();
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        let to_remove: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in to_remove {
            self.entries.remove(&key);
        }
    }

    fn current_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.value.len()).sum()
    }

    fn evict_if_over_budget(&self) {
        if self.current_bytes() <= self.max_bytes {
            return;
        }
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.stored_at))
            .collect();
        by_age.sort_by_key(|(_, stored_at)| *stored_at);

        for (key, _) in by_age {
            if self.current_bytes() <= self.max_bytes {
                break;
            }
            self.entries.remove(&key);
        }
    }
}

pub fn etag_for(content: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("\"{:x}\"", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let cache = Cache::new(1024 * 1024);
        cache.put("lineup", "[]", etag_for("[]"), TTL_LINEUP);
        let value = cache.get("lineup").unwrap();
        assert_eq!(value.value, "[]");
        assert!(!value.stale);
    }

    #[test]
    fn missing_key_returns_none() {
        let cache = Cache::new(1024 * 1024);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn eviction_respects_byte_budget() {
        let cache = Cache::new(10);
        cache.put("a", "0123456789", "etag-a", TTL_LINEUP);
        cache.put("b", "0123456789", "etag-b", TTL_LINEUP);
        // Budget of 10 bytes can't hold both 10-byte entries; oldest evicted.
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn invalidate_prefix_clears_matching_keys() {
        let cache = Cache::new(1024);
        cache.put("metadata:1", "x", "e1", TTL_METADATA_SHELL);
        cache.put("metadata:2", "y", "e2", TTL_METADATA_SHELL);
        cache.put("lineup", "z", "e3", TTL_LINEUP);
        cache.invalidate_prefix("metadata:");
        assert!(cache.get("metadata:1").is_none());
        assert!(cache.get("metadata:2").is_none());
        assert!(cache.get("lineup").is_some());
    }
}
