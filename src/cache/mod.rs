//! Injected TTL cache.
//!
//! Time comes from a [`Clock`] so tests can advance it by hand. Expired
//! entries read as absent. They are dropped when touched, by the periodic
//! sweep on insert, or on [`TtlCache::prune`]. The entry count is capped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Entries<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Inserts at or after this instant sweep expired entries first.
    next_sweep: Instant,
}

/// Entry cap for caches built without [`TtlCache::with_capacity`].
pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    entries: Mutex<Entries<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let next_sweep = clock.now() + ttl;
        TtlCache {
            ttl,
            capacity: DEFAULT_CAPACITY,
            clock,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                next_sweep,
            }),
        }
    }

    /// Caps the number of stored entries. Inserting a new key into a full
    /// cache evicts the entry closest to expiry.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().ok()?;
        match entries.map.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores `value` under `key`.
    ///
    /// Expired entries are swept at most once per TTL, so the map never
    /// holds much more than one TTL's worth of keys beyond `capacity`.
    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if now >= entries.next_sweep {
            entries.map.retain(|_, entry| entry.expires_at > now);
            entries.next_sweep = now + self.ttl;
        }
        if entries.map.len() >= self.capacity && !entries.map.contains_key(&key) {
            entries.map.retain(|_, entry| entry.expires_at > now);
            if entries.map.len() >= self.capacity {
                evict_soonest(&mut entries.map);
            }
        }
        entries.map.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Returns the cached value, or computes, stores and returns a fresh
    /// one. Errors are not cached.
    pub fn get_or_try_insert<E>(&self, key: K, load: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = load()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.map.remove(key);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.map.clear();
        }
    }

    /// Drops every expired entry.
    pub fn prune(&self) {
        let now = self.clock.now();
        if let Ok(mut entries) = self.entries.lock() {
            entries.map.retain(|_, entry| entry.expires_at > now);
        }
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.prune();
        self.stored()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held in memory, expired or not.
    pub(crate) fn stored(&self) -> usize {
        self.entries.lock().map(|e| e.map.len()).unwrap_or(0)
    }
}

fn evict_soonest<K: Eq + Hash + Clone, V>(map: &mut HashMap<K, Entry<V>>) {
    let soonest = map
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at)
        .map(|(key, _)| key.clone());
    if let Some(key) = soonest {
        map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_secs: u64) -> (TtlCache<&'static str, u32>, ManualClock) {
        let clock = ManualClock::new();
        let cache = TtlCache::with_clock(Duration::from_secs(ttl_secs), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock) = cache(60);
        cache.insert("a", 1);

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get(&"a"), Some(1));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_refreshes_expiry() {
        let (cache, clock) = cache(10);
        cache.insert("a", 1);
        clock.advance(Duration::from_secs(8));
        cache.insert("a", 2);
        clock.advance(Duration::from_secs(8));
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn invalidation() {
        let (cache, _) = cache(60);
        cache.insert("a", 1);
        cache.insert("b", 2);

        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn len_counts_only_live_entries() {
        let (cache, clock) = cache(10);
        cache.insert("old", 1);
        clock.advance(Duration::from_secs(5));
        cache.insert("new", 2);
        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn inserts_sweep_expired_entries() {
        let (cache, clock) = cache(1);
        for key in ["a", "b", "c", "d"] {
            cache.insert(key, 1);
        }
        assert_eq!(cache.stored(), 4);

        clock.advance(Duration::from_secs(2));
        cache.insert("e", 2);
        assert_eq!(cache.stored(), 1);
        assert_eq!(cache.get(&"e"), Some(2));
    }

    #[test]
    fn full_cache_evicts_soonest_expiry() {
        let (cache, clock) = cache(60);
        let cache = cache.with_capacity(2);
        cache.insert("a", 1);
        clock.advance(Duration::from_secs(1));
        cache.insert("b", 2);
        clock.advance(Duration::from_secs(1));
        cache.insert("c", 3);

        assert_eq!(cache.stored(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));

        // Overwriting an existing key never evicts.
        cache.insert("c", 4);
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn loader_errors_are_not_cached() {
        let (cache, _) = cache(60);
        let failed: Result<u32, &str> = cache.get_or_try_insert("a", || Err("db down"));
        assert_eq!(failed, Err("db down"));

        let loaded: Result<u32, &str> = cache.get_or_try_insert("a", || Ok(7));
        assert_eq!(loaded, Ok(7));
        let cached: Result<u32, &str> = cache.get_or_try_insert("a", || Ok(8));
        assert_eq!(cached, Ok(7));
    }
}
