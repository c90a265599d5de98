//! TTL-bounded result cache served while a circuit is unhealthy.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    inserted_at: Instant,
}

/// Type-erased cache of the last good result per key.
///
/// Entries expire after `ttl`; when full, the oldest entry is evicted.
pub(crate) struct ResultCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    max_size: usize,
}

impl ResultCache {
    pub(crate) fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_size,
        }
    }

    pub(crate) fn put<T>(&mut self, key: &str, value: T, now: Instant)
    where
        T: Send + Sync + 'static,
    {
        if self.max_size == 0 {
            return;
        }
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_size {
            self.evict_oldest();
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Arc::new(value),
                inserted_at: now,
            },
        );
    }

    /// Fetch a live entry. A stored value of a different type counts as a miss.
    pub(crate) fn get<T>(&self, key: &str, now: Instant) -> Option<T>
    where
        T: Clone + 'static,
    {
        let entry = self.entries.get(key)?;
        if now.duration_since(entry.inserted_at) > self.ttl {
            return None;
        }
        entry.value.downcast_ref::<T>().cloned()
    }

    /// Drop expired entries and enforce the size bound. Returns how many were removed.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
        while self.entries.len() > self.max_size {
            self.evict_oldest();
        }
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.inserted_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_value_within_ttl() {
        let mut cache = ResultCache::new(Duration::from_secs(10), 4);
        cache.put("k", 42u32, Instant::now());
        assert_eq!(cache.get::<u32>("k", Instant::now()), Some(42));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get::<u32>("k", Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_mismatch_is_miss() {
        let mut cache = ResultCache::new(Duration::from_secs(10), 4);
        cache.put("k", "text".to_string(), Instant::now());
        assert_eq!(cache.get::<u32>("k", Instant::now()), None);
        assert_eq!(
            cache.get::<String>("k", Instant::now()),
            Some("text".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_evicts_oldest() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.put("a", 1u8, Instant::now());
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put("b", 2u8, Instant::now());
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put("c", 3u8, Instant::now());

        let now = Instant::now();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get::<u8>("a", now), None);
        assert_eq!(cache.get::<u8>("b", now), Some(2));
        assert_eq!(cache.get::<u8>("c", now), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let mut cache = ResultCache::new(Duration::from_secs(5), 10);
        cache.put("old", 1u8, Instant::now());
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.put("new", 2u8, Instant::now());

        assert_eq!(cache.sweep(Instant::now()), 1);
        assert_eq!(cache.len(), 1);
    }
}
