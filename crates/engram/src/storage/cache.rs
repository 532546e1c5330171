//! Ephemeral read cache for query responses
//!
//! Process-local and lost on restart by construction. Entries expire after a
//! fixed TTL and are invalidated eagerly on any mutation, so the durable
//! store stays the single source of truth.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A TTL-bounded response cache keyed by request shape.
pub struct TtlCache {
    entries: DashMap<String, (Instant, serde_json::Value)>,
    ttl: Duration,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Get a cached value if present and not expired. Expired entries are
    /// removed on the way out.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (inserted, value) = entry.value();
                if inserted.elapsed() < self.ttl {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: String, value: serde_json::Value) {
        self.entries.insert(key, (Instant::now(), value));
    }

    /// Drop every entry whose key starts with the prefix. Mutations call this
    /// with the affected endpoint's prefix.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.put("search:q=rust".to_string(), serde_json::json!({"hits": 3}));

        let value = cache.get("search:q=rust").unwrap();
        assert_eq!(value["hits"], 3);
        assert!(cache.get("search:q=go").is_none());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.put("k".to_string(), serde_json::json!(1));

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.put("search:a".to_string(), serde_json::json!(1));
        cache.put("search:b".to_string(), serde_json::json!(2));
        cache.put("brief:24".to_string(), serde_json::json!(3));

        cache.invalidate_prefix("search:");

        assert!(cache.get("search:a").is_none());
        assert!(cache.get("search:b").is_none());
        assert!(cache.get("brief:24").is_some());
    }

    #[test]
    fn test_clear() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.put("a".to_string(), serde_json::json!(1));
        cache.clear();
        assert!(cache.is_empty());
    }
}
