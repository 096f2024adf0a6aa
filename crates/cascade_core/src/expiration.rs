//! Size-weighted LRU expiration for in-memory caches.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Weak;
use tracing::debug;

/// Something whose in-memory cache can be dropped under pressure.
///
/// Eviction only releases deserialized state; persisted rows are never
/// touched.
pub trait Evictable: Send + Sync {
    /// Drops the in-memory cached state.
    fn clear_cache(&self);
}

/// Identifies one tracked cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Owning class name.
    pub class: String,
    /// Entity id text.
    pub id: String,
}

impl CacheKey {
    /// Creates a cache key.
    #[must_use]
    pub fn new(class: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            id: id.into(),
        }
    }
}

struct TrackedEntry {
    weight: u64,
    target: Weak<dyn Evictable>,
}

struct LruState {
    entries: LruCache<CacheKey, TrackedEntry>,
    total_weight: u64,
}

/// A store-wide size-weighted LRU over live cache entries.
///
/// `touch` inserts or refreshes an entry; once the total tracked weight
/// exceeds the capacity, least-recently-used entries are evicted by
/// calling [`Evictable::clear_cache`] on them. Entries whose target has
/// been dropped fall out on eviction for free.
pub struct ExpirationStrategy {
    capacity: u64,
    state: Mutex<LruState>,
}

impl ExpirationStrategy {
    /// Creates a strategy with the given weight capacity in bytes.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState {
                entries: LruCache::unbounded(),
                total_weight: 0,
            }),
        }
    }

    /// Inserts or refreshes an entry, then evicts until the total weight
    /// fits the capacity again.
    pub fn touch(&self, key: CacheKey, weight: u64, target: Weak<dyn Evictable>) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(old) = state.entries.put(key, TrackedEntry { weight, target }) {
                state.total_weight -= old.weight;
            }
            state.total_weight += weight;

            // The entry just touched is most-recently used, so it is only
            // popped when it is the sole (oversized) entry - leave that
            // one in place.
            while state.total_weight > self.capacity && state.entries.len() > 1 {
                let Some((key, entry)) = state.entries.pop_lru() else {
                    break;
                };
                state.total_weight -= entry.weight;
                evicted.push((key, entry.target));
            }
        }
        // Clear caches outside the lock: targets lock their own state.
        for (key, target) in evicted {
            if let Some(target) = target.upgrade() {
                debug!(class = %key.class, id = %key.id, "evicting cached value");
                target.clear_cache();
            }
        }
    }

    /// Removes an entry without clearing its cache.
    pub fn forget(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.pop(key) {
            state.total_weight -= entry.weight;
        }
    }

    /// Returns the total tracked weight.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.state.lock().total_weight
    }

    /// Returns the number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    struct Probe {
        cleared: PlMutex<bool>,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cleared: PlMutex::new(false),
            })
        }
    }

    impl Evictable for Probe {
        fn clear_cache(&self) {
            *self.cleared.lock() = true;
        }
    }

    fn weak(probe: &Arc<Probe>) -> Weak<dyn Evictable> {
        let arc: Arc<dyn Evictable> = Arc::clone(probe) as Arc<dyn Evictable>;
        Arc::downgrade(&arc)
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let lru = ExpirationStrategy::new(100);
        let a = Probe::new();
        let b = Probe::new();
        let c = Probe::new();

        lru.touch(CacheKey::new("t", "a"), 40, weak(&a));
        lru.touch(CacheKey::new("t", "b"), 40, weak(&b));
        // Refresh `a` so `b` becomes the eviction candidate.
        lru.touch(CacheKey::new("t", "a"), 40, weak(&a));
        lru.touch(CacheKey::new("t", "c"), 40, weak(&c));

        assert!(*b.cleared.lock(), "least-recently-used entry evicted");
        assert!(!*a.cleared.lock());
        assert!(!*c.cleared.lock());
        assert!(lru.total_weight() <= 100);
    }

    #[test]
    fn refresh_replaces_weight() {
        let lru = ExpirationStrategy::new(1000);
        let a = Probe::new();
        lru.touch(CacheKey::new("t", "a"), 400, weak(&a));
        lru.touch(CacheKey::new("t", "a"), 100, weak(&a));
        assert_eq!(lru.total_weight(), 100);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn sole_oversized_entry_survives() {
        let lru = ExpirationStrategy::new(10);
        let a = Probe::new();
        lru.touch(CacheKey::new("t", "a"), 50, weak(&a));
        assert!(!*a.cleared.lock());
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn forget_removes_without_clearing() {
        let lru = ExpirationStrategy::new(100);
        let a = Probe::new();
        let key = CacheKey::new("t", "a");
        lru.touch(key.clone(), 40, weak(&a));
        lru.forget(&key);
        assert!(lru.is_empty());
        assert!(!*a.cleared.lock());
    }
}
