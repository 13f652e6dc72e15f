//! Cost-accounted key-to-bitmap store with recency-based eviction.
//!
//! Every entry carries a cost (its decoded byte footprint) and the cache
//! enforces both a total-cost limit and an entry-count limit. Insertions
//! that would exceed either limit evict least-recently-used entries until
//! both limits hold again.
//!
//! # Determinism
//!
//! Recency is a monotonically increasing tick stamped on every access.
//! Ticks are unique, so the eviction victim is always well-defined and a
//! fixed access sequence always produces the same resident set.
//!
//! # Thread Safety
//!
//! All operations are individually atomic behind one internal mutex held
//! only for map bookkeeping; callers never lock externally. Bitmaps are
//! shared out as `Arc` clones and treated as immutable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::key::ImageKey;

/// Size and count limits for one cache tier.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Maximum summed entry cost in bytes.
    pub max_cost: u64,
    /// Maximum number of resident entries.
    pub max_entries: usize,
}

impl CacheLimits {
    /// Creates limits from a cost budget and an entry count.
    pub fn new(max_cost: u64, max_entries: usize) -> Self {
        Self {
            max_cost,
            max_entries,
        }
    }
}

/// Point-in-time counters for one cache tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed to satisfy the limits.
    pub evictions: u64,
}

struct CachedEntry {
    image: Arc<DynamicImage>,
    cost: u64,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<ImageKey, CachedEntry>,
    total_cost: u64,
    tick: u64,
}

/// Bounded key-to-bitmap store with cost-based LRU eviction.
pub struct BoundedCache {
    /// Tier name for log context.
    name: &'static str,
    limits: CacheLimits,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BoundedCache {
    /// Creates an empty cache with the given limits.
    pub fn new(name: &'static str, limits: CacheLimits) -> Self {
        Self {
            name,
            limits,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_cost: 0,
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Looks up a bitmap and marks it most recently used.
    pub fn get(&self, key: &ImageKey) -> Option<Arc<DynamicImage>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.image))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a bitmap at the given cost, evicting until both limits hold.
    ///
    /// Replacing an existing key releases the old entry's cost first. An
    /// entry whose own cost exceeds the cost limit is not admitted.
    pub fn insert(&self, key: ImageKey, image: Arc<DynamicImage>, cost: u64) {
        if cost > self.limits.max_cost {
            debug!(
                tier = self.name,
                key = %key,
                cost,
                limit = self.limits.max_cost,
                "entry exceeds cache budget, not admitted"
            );
            return;
        }

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(previous) = inner.entries.insert(
            key,
            CachedEntry {
                image,
                cost,
                last_used: tick,
            },
        ) {
            inner.total_cost -= previous.cost;
        }
        inner.total_cost += cost;

        while inner.total_cost > self.limits.max_cost
            || inner.entries.len() > self.limits.max_entries
        {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else { break };
            if let Some(removed) = inner.entries.remove(&victim) {
                inner.total_cost -= removed.cost;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(tier = self.name, key = %victim, cost = removed.cost, "evicted");
            }
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.total_cost = 0;
        debug!(tier = self.name, entries = dropped, "cache cleared");
    }

    /// Current number of resident entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed cost of resident entries in bytes.
    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    /// The configured limits.
    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    /// Snapshot of the hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(name: &str) -> ImageKey {
        ImageKey::Original {
            url: format!("https://host/{name}"),
        }
    }

    fn bitmap() -> Arc<DynamicImage> {
        Arc::new(DynamicImage::new_rgb8(1, 1))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = BoundedCache::new("test", CacheLimits::new(1000, 10));
        let image = bitmap();
        cache.insert(key("a"), Arc::clone(&image), 100);

        let found = cache.get(&key("a")).expect("entry should be resident");
        assert!(Arc::ptr_eq(&found, &image));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 100);
    }

    #[test]
    fn test_get_missing_records_miss() {
        let cache = BoundedCache::new("test", CacheLimits::new(1000, 10));
        assert!(cache.get(&key("nope")).is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_replace_existing_releases_old_cost() {
        let cache = BoundedCache::new("test", CacheLimits::new(1000, 10));
        cache.insert(key("a"), bitmap(), 400);
        cache.insert(key("a"), bitmap(), 250);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 250);
    }

    #[test]
    fn test_cost_limit_evicts_least_recently_used() {
        let cache = BoundedCache::new("test", CacheLimits::new(300, 10));
        cache.insert(key("a"), bitmap(), 100);
        cache.insert(key("b"), bitmap(), 100);
        cache.insert(key("c"), bitmap(), 100);

        // Touch "a" so "b" becomes the eviction victim.
        assert!(cache.get(&key("a")).is_some());

        cache.insert(key("d"), bitmap(), 100);

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert!(cache.get(&key("d")).is_some());
        assert_eq!(cache.total_cost(), 300);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_entry_count_limit_evicts() {
        let cache = BoundedCache::new("test", CacheLimits::new(10_000, 2));
        cache.insert(key("a"), bitmap(), 10);
        cache.insert(key("b"), bitmap(), 10);
        cache.insert(key("c"), bitmap(), 10);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_eviction_is_deterministic_for_fixed_access_sequence() {
        // The same sequence must always leave the same resident set.
        for _ in 0..8 {
            let cache = BoundedCache::new("test", CacheLimits::new(200, 10));
            cache.insert(key("a"), bitmap(), 100);
            cache.insert(key("b"), bitmap(), 100);
            assert!(cache.get(&key("a")).is_some());
            cache.insert(key("c"), bitmap(), 100);

            assert!(cache.get(&key("b")).is_none());
            assert!(cache.get(&key("a")).is_some());
            assert!(cache.get(&key("c")).is_some());
        }
    }

    #[test]
    fn test_oversized_entry_is_not_admitted() {
        let cache = BoundedCache::new("test", CacheLimits::new(100, 10));
        cache.insert(key("huge"), bitmap(), 101);
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = BoundedCache::new("test", CacheLimits::new(1000, 10));
        cache.insert(key("a"), bitmap(), 100);
        cache.insert(key("b"), bitmap(), 100);

        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn test_evicted_key_misses_afterwards() {
        let cache = BoundedCache::new("test", CacheLimits::new(150, 10));
        cache.insert(key("a"), bitmap(), 100);
        cache.insert(key("b"), bitmap(), 100);

        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
    }

    proptest! {
        /// Both limits hold after every insertion, whatever the sequence.
        #[test]
        fn prop_limits_hold_under_arbitrary_insertions(
            ops in prop::collection::vec((0u8..8u8, 1u64..600u64), 1..64)
        ) {
            let cache = BoundedCache::new("prop", CacheLimits::new(2048, 4));
            for (slot, cost) in ops {
                cache.insert(key(&format!("slot{slot}")), bitmap(), cost);
                prop_assert!(cache.total_cost() <= 2048);
                prop_assert!(cache.len() <= 4);
            }
        }
    }

    proptest! {
        /// Interleaved lookups never break the accounting.
        #[test]
        fn prop_limits_hold_with_interleaved_gets(
            ops in prop::collection::vec((0u8..6u8, 1u64..500u64, any::<bool>()), 1..48)
        ) {
            let cache = BoundedCache::new("prop", CacheLimits::new(1024, 3));
            for (slot, cost, lookup) in ops {
                let k = key(&format!("slot{slot}"));
                if lookup {
                    let _ = cache.get(&k);
                } else {
                    cache.insert(k, bitmap(), cost);
                }
                prop_assert!(cache.total_cost() <= 1024);
                prop_assert!(cache.len() <= 3);
            }
        }
    }
}
