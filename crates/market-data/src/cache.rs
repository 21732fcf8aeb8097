use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Time source for cache expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

struct CacheEntry<V> {
    data: V,
    cached_at: DateTime<Utc>,
    ttl: Duration,
}

/// Concurrent map whose entries expire after a per-entry TTL.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let hit = self.entries.get(key).and_then(|entry| {
            (now - entry.cached_at < entry.ttl).then(|| entry.data.clone())
        });
        if hit.is_none() {
            self.entries
                .remove_if(key, |_, entry| now - entry.cached_at >= entry.ttl);
        }
        hit
    }

    pub fn insert(&self, key: K, data: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                data,
                cached_at: self.clock.now(),
                ttl,
            },
        );
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
    use chrono::TimeZone;

    fn cache() -> (Arc<ManualClock>, TtlCache<String, u32>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()));
        let cache = TtlCache::new(clock.clone() as Arc<dyn Clock>);
        (clock, cache)
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let (clock, cache) = cache();
        cache.insert("AAPL".to_string(), 7, Duration::hours(1));

        clock.advance(Duration::minutes(59));
        assert_eq!(cache.get(&"AAPL".to_string()), Some(7));

        clock.advance(Duration::minutes(1));
        assert_eq!(cache.get(&"AAPL".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_is_per_entry() {
        let (clock, cache) = cache();
        cache.insert("daily".to_string(), 1, Duration::hours(1));
        cache.insert("monthly".to_string(), 2, Duration::hours(4));

        clock.advance(Duration::hours(2));
        assert_eq!(cache.get(&"daily".to_string()), None);
        assert_eq!(cache.get(&"monthly".to_string()), Some(2));
    }
}
