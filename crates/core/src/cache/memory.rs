//! Bounded in-memory cache with least-recently-used eviction.
//!
//! Entries are kept in access order: `get` and `put` move an entry to the
//! young end, eviction pops from the old end until the tracked size fits.
//! Size is measured in caller-defined units through an injected `size_of`
//! function (one unit per entry by default) and is computed once, at insert
//! time, then stored next to the value.
//!
//! ### Hooks and locking
//!
//! All map mutations happen under one short-lived lock. The three injected
//! hooks never run while that lock is held:
//!
//! - `create` may be slow; other threads keep using the cache meanwhile. If a
//!   value for the same key was committed while `create` ran, the created
//!   value is discarded and reported through `on_removed`.
//! - `on_removed` sees evictions, explicit removals and replacements, and may
//!   interleave arbitrarily with other cache operations.
//! - `size_of` is called before the lock is taken.
//!
//! Sizes are unsigned, so a negative weight cannot be reported. A non-zero
//! tracked size with an empty map is a broken invariant and panics.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Size function: returns the weight of an entry in cache units.
pub type SizeFn<K, V> = Arc<dyn Fn(&K, &V) -> usize + Send + Sync>;

/// Removal hook: `(evicted, key, old_value, new_value)`.
///
/// `evicted` is true only when the entry was dropped to make room.
/// `new_value` is set when the removal was caused by a replacement, or when a
/// created value lost a race against an already-committed one.
pub type RemovedFn<K, V> = Arc<dyn Fn(bool, &K, &V, Option<&V>) + Send + Sync>;

/// Value producer invoked on a miss. Returning `None` leaves the miss a miss.
pub type CreateFn<K, V> = Arc<dyn Fn(&K) -> Option<V> + Send + Sync>;

/// A resident value with the size computed when it was inserted.
struct MemoryEntry<V> {
    value: V,
    size: usize,
}

struct Inner<K, V> {
    map: LruCache<K, MemoryEntry<V>>,
    size: usize,
    max_size: usize,
    put_count: u64,
    create_count: u64,
    eviction_count: u64,
    hit_count: u64,
    miss_count: u64,
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn assert_consistent(&self) {
        if self.map.is_empty() && self.size != 0 {
            panic!("memory cache size accounting is inconsistent: empty map with size {}", self.size);
        }
    }
}

/// How far a trim pass should go.
#[derive(Clone, Copy)]
enum TrimTarget {
    /// Down to the configured maximum, read under the lock on every step.
    MaxSize,
    /// Down to an explicit size.
    AtMost(usize),
    /// Everything, including zero-sized entries.
    Empty,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub size: usize,
    pub max_size: usize,
    pub entry_count: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub put_count: u64,
    pub create_count: u64,
    pub eviction_count: u64,
}

impl MemoryStats {
    /// Hits as a whole percentage of all lookups (0 when there were none).
    pub fn hit_percent(&self) -> u64 {
        let accesses = self.hit_count + self.miss_count;
        if accesses == 0 { 0 } else { 100 * self.hit_count / accesses }
    }
}

/// Builder for [`MemoryCache`] carrying the injected hooks.
pub struct MemoryCacheBuilder<K, V> {
    max_size: usize,
    size_of: Option<SizeFn<K, V>>,
    on_removed: Option<RemovedFn<K, V>>,
    create: Option<CreateFn<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> MemoryCacheBuilder<K, V> {
    /// Weigh entries with `f` instead of one unit per entry.
    pub fn size_of(mut self, f: impl Fn(&K, &V) -> usize + Send + Sync + 'static) -> Self {
        self.size_of = Some(Arc::new(f));
        self
    }

    /// Observe every removal. Runs without the cache lock held.
    pub fn on_removed(mut self, f: impl Fn(bool, &K, &V, Option<&V>) + Send + Sync + 'static) -> Self {
        self.on_removed = Some(Arc::new(f));
        self
    }

    /// Produce values for missing keys. Runs without the cache lock held.
    pub fn create(mut self, f: impl Fn(&K) -> Option<V> + Send + Sync + 'static) -> Self {
        self.create = Some(Arc::new(f));
        self
    }

    /// Build the cache.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `max_size` is 0.
    pub fn build(self) -> Result<MemoryCache<K, V>, Error> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig("memory cache max_size must be greater than 0".into()));
        }

        Ok(MemoryCache {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                size: 0,
                max_size: self.max_size,
                put_count: 0,
                create_count: 0,
                eviction_count: 0,
                hit_count: 0,
                miss_count: 0,
            }),
            size_of: self.size_of,
            on_removed: self.on_removed,
            create: self.create,
        })
    }
}

/// Thread-safe LRU cache bounded by total entry size.
pub struct MemoryCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    size_of: Option<SizeFn<K, V>>,
    on_removed: Option<RemovedFn<K, V>>,
    create: Option<CreateFn<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> MemoryCache<K, V> {
    /// Count-based cache holding at most `max_size` entries, with no hooks.
    pub fn new(max_size: usize) -> Result<Self, Error> {
        Self::builder(max_size).build()
    }

    /// Start building a cache whose total size may not exceed `max_size`.
    pub fn builder(max_size: usize) -> MemoryCacheBuilder<K, V> {
        MemoryCacheBuilder { max_size, size_of: None, on_removed: None, create: None }
    }

    /// Look up `key`, marking it most recently used on a hit.
    ///
    /// On a miss the `create` hook (if any) is invoked outside the lock. If
    /// another value for `key` was committed in the meantime, that value wins
    /// and the created one is handed to `on_removed` with `evicted = false`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        {
            let mut inner = self.inner.lock();
            if let Some(value) = inner.map.get(key).map(|entry| entry.value.clone()) {
                inner.hit_count += 1;
                return Some(value);
            }
            inner.miss_count += 1;
        }

        let create = self.create.as_ref()?;
        let key = key.to_owned();
        let created = create(&key)?;
        let size = self.entry_size(&key, &created);

        let existing = {
            let mut inner = self.inner.lock();
            inner.create_count += 1;
            match inner.map.get::<K>(&key).map(|entry| entry.value.clone()) {
                Some(existing) => Some(existing),
                None => {
                    inner.map.put(key.clone(), MemoryEntry { value: created.clone(), size });
                    inner.size += size;
                    None
                }
            }
        };

        match existing {
            Some(existing) => {
                self.notify_removed(false, &key, &created, Some(&existing));
                Some(existing)
            }
            None => {
                self.trim(TrimTarget::MaxSize);
                Some(created)
            }
        }
    }

    /// Insert or replace `key`, returning the value it replaced.
    ///
    /// The new entry becomes most recently used; eviction runs afterwards.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let size = self.entry_size(&key, &value);

        let previous = {
            let mut inner = self.inner.lock();
            inner.put_count += 1;
            inner.size += size;
            let previous = inner.map.put(key.clone(), MemoryEntry { value: value.clone(), size });
            if let Some(previous) = &previous {
                inner.size -= previous.size;
            }
            previous
        };

        if let Some(previous) = &previous {
            self.notify_removed(false, &key, &previous.value, Some(&value));
        }

        self.trim(TrimTarget::MaxSize);
        previous.map(|entry| entry.value)
    }

    /// Remove `key`, returning its value if it was resident.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (key, entry) = {
            let mut inner = self.inner.lock();
            let (key, entry) = inner.map.pop_entry(key)?;
            inner.size -= entry.size;
            (key, entry)
        };

        self.notify_removed(false, &key, &entry.value, None);
        Some(entry.value)
    }

    /// Whether `key` is resident. Does not touch access order or counters.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().map.contains(key)
    }

    /// Evict least recently used entries until the size is at most `max_size`.
    pub fn trim_to_size(&self, max_size: usize) {
        self.trim(TrimTarget::AtMost(max_size));
    }

    /// Change the maximum size and evict immediately if it shrank.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `max_size` is 0.
    pub fn resize(&self, max_size: usize) -> Result<(), Error> {
        if max_size == 0 {
            return Err(Error::InvalidConfig("memory cache max_size must be greater than 0".into()));
        }
        self.inner.lock().max_size = max_size;
        self.trim(TrimTarget::MaxSize);
        Ok(())
    }

    /// Evict every entry, reporting each one through `on_removed`.
    pub fn evict_all(&self) {
        self.trim(TrimTarget::Empty);
    }

    /// Contents ordered from least to most recently used.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let inner = self.inner.lock();
        inner
            .map
            .iter()
            .rev()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Current counters.
    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock();
        MemoryStats {
            size: inner.size,
            max_size: inner.max_size,
            entry_count: inner.map.len(),
            hit_count: inner.hit_count,
            miss_count: inner.miss_count,
            put_count: inner.put_count,
            create_count: inner.create_count,
            eviction_count: inner.eviction_count,
        }
    }

    /// Sum of the sizes of resident entries.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.inner.lock().hit_count
    }

    pub fn miss_count(&self) -> u64 {
        self.inner.lock().miss_count
    }

    pub fn put_count(&self) -> u64 {
        self.inner.lock().put_count
    }

    pub fn create_count(&self) -> u64 {
        self.inner.lock().create_count
    }

    pub fn eviction_count(&self) -> u64 {
        self.inner.lock().eviction_count
    }

    fn entry_size(&self, key: &K, value: &V) -> usize {
        match &self.size_of {
            Some(size_of) => size_of(key, value),
            None => 1,
        }
    }

    fn notify_removed(&self, evicted: bool, key: &K, old: &V, new: Option<&V>) {
        if let Some(on_removed) = &self.on_removed {
            on_removed(evicted, key, old, new);
        }
    }

    /// Pop eldest entries one at a time, releasing the lock before each hook.
    fn trim(&self, target: TrimTarget) {
        loop {
            let (key, entry) = {
                let mut inner = self.inner.lock();
                inner.assert_consistent();

                let done = match target {
                    TrimTarget::MaxSize => inner.size <= inner.max_size,
                    TrimTarget::AtMost(limit) => inner.size <= limit,
                    TrimTarget::Empty => false,
                };
                if done || inner.map.is_empty() {
                    break;
                }

                let Some((key, entry)) = inner.map.pop_lru() else {
                    break;
                };
                inner.size -= entry.size;
                inner.eviction_count += 1;
                (key, entry)
            };

            self.notify_removed(true, &key, &entry.value, None);
        }
    }
}

impl<K: Hash + Eq, V> fmt::Display for MemoryCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let accesses = inner.hit_count + inner.miss_count;
        let hit_percent = if accesses == 0 { 0 } else { 100 * inner.hit_count / accesses };
        write!(
            f,
            "MemoryCache[max_size={},hits={},misses={},hit_rate={}%]",
            inner.max_size, inner.hit_count, inner.miss_count, hit_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    type Removal = (bool, String, u32, Option<u32>);

    fn recording_cache(max_size: usize) -> (MemoryCache<String, u32>, Arc<Mutex<Vec<Removal>>>) {
        let removals = Arc::new(Mutex::new(Vec::new()));
        let sink = removals.clone();
        let cache = MemoryCache::builder(max_size)
            .on_removed(move |evicted, key: &String, old: &u32, new: Option<&u32>| {
                sink.lock().push((evicted, key.clone(), *old, new.copied()));
            })
            .build()
            .unwrap();
        (cache, removals)
    }

    fn keys(cache: &MemoryCache<String, u32>) -> Vec<String> {
        cache.snapshot().into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_zero_max_size_rejected() {
        let result = MemoryCache::<String, u32>::new(0);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_count_based_eviction_scenario() {
        let cache = MemoryCache::new(3).unwrap();
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.put(key.to_string(), i as u32);
        }

        assert_eq!(keys(&cache), vec!["b", "c", "d"]);
        assert_eq!(cache.eviction_count(), 1);
        assert_eq!(cache.size(), 3);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_get_refreshes_access_order() {
        let cache = MemoryCache::new(3).unwrap();
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.put("c".to_string(), 3);

        assert_eq!(cache.get("a"), Some(1));
        cache.put("d".to_string(), 4);

        assert_eq!(keys(&cache), vec!["c", "a", "d"]);
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = MemoryCache::new(2).unwrap();
        cache.put("a".to_string(), 1);
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.put_count, 1);
        assert_eq!(stats.hit_percent(), 66);
        assert_eq!(cache.to_string(), "MemoryCache[max_size=2,hits=2,misses=1,hit_rate=66%]");
    }

    #[test]
    fn test_size_tracks_sum_of_entry_sizes() {
        let cache: MemoryCache<String, Vec<u8>> =
            MemoryCache::builder(100).size_of(|_, v: &Vec<u8>| v.len()).build().unwrap();

        cache.put("a".to_string(), vec![0; 10]);
        cache.put("b".to_string(), vec![0; 20]);
        cache.put("a".to_string(), vec![0; 5]);
        assert_eq!(cache.size(), 25);

        cache.remove("b");
        assert_eq!(cache.size(), 5);

        let expected: usize = cache.snapshot().iter().map(|(_, v)| v.len()).sum();
        assert_eq!(cache.size(), expected);
    }

    #[test]
    fn test_weighted_eviction_stays_within_budget() {
        let cache: MemoryCache<String, Vec<u8>> =
            MemoryCache::builder(100).size_of(|_, v: &Vec<u8>| v.len()).build().unwrap();

        for i in 0..10 {
            cache.put(format!("k{i}"), vec![0; 30]);
            assert!(cache.size() <= cache.max_size());
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.eviction_count(), 7);
    }

    #[test]
    fn test_oversized_entry_is_evicted_immediately() {
        let cache: MemoryCache<String, Vec<u8>> =
            MemoryCache::builder(10).size_of(|_, v: &Vec<u8>| v.len()).build().unwrap();
        cache.put("small".to_string(), vec![0; 4]);
        cache.put("huge".to_string(), vec![0; 11]);

        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_replace_reports_old_and_new() {
        let (cache, removals) = recording_cache(5);
        assert_eq!(cache.put("a".to_string(), 1), None);
        assert_eq!(cache.put("a".to_string(), 2), Some(1));

        assert_eq!(*removals.lock(), vec![(false, "a".to_string(), 1, Some(2))]);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_remove_and_evict_callbacks() {
        let (cache, removals) = recording_cache(2);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.put("c".to_string(), 3);
        assert_eq!(cache.remove("b"), Some(2));
        assert_eq!(cache.remove("b"), None);

        assert_eq!(
            *removals.lock(),
            vec![(true, "a".to_string(), 1, None), (false, "b".to_string(), 2, None)]
        );
    }

    #[test]
    fn test_evict_all_removes_zero_sized_entries() {
        let removals = Arc::new(AtomicUsize::new(0));
        let counter = removals.clone();
        let cache: MemoryCache<String, u32> = MemoryCache::builder(10)
            .size_of(|_, _| 0)
            .on_removed(move |evicted, _, _, _| {
                assert!(evicted);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.trim_to_size(0);
        assert_eq!(cache.len(), 2);

        cache.evict_all();
        assert!(cache.is_empty());
        assert_eq!(removals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resize_shrinks_immediately() {
        let cache = MemoryCache::new(4).unwrap();
        for key in ["a", "b", "c", "d"] {
            cache.put(key.to_string(), 0u32);
        }

        cache.resize(2).unwrap();
        assert_eq!(keys(&cache), vec!["c", "d"]);
        assert_eq!(cache.max_size(), 2);
        assert!(cache.resize(0).is_err());
    }

    #[test]
    fn test_create_on_miss() {
        let cache: MemoryCache<String, usize> =
            MemoryCache::builder(10).create(|key: &String| Some(key.len())).build().unwrap();

        assert_eq!(cache.get("four"), Some(4));
        assert_eq!(cache.get("four"), Some(4));

        let stats = cache.stats();
        assert_eq!(stats.create_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_count, 1);
    }

    #[test]
    fn test_create_returning_none_stays_a_miss() {
        let cache: MemoryCache<String, u32> = MemoryCache::builder(10).create(|_| None).build().unwrap();
        assert_eq!(cache.get("x"), None);
        assert_eq!(cache.create_count(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_create_keeps_first_committed_value() {
        let barrier = Arc::new(Barrier::new(2));
        let next_value = Arc::new(AtomicUsize::new(100));
        let removals: Arc<Mutex<Vec<(bool, usize, Option<usize>)>>> = Arc::new(Mutex::new(Vec::new()));

        let gate = barrier.clone();
        let counter = next_value.clone();
        let sink = removals.clone();
        let cache: Arc<MemoryCache<String, usize>> = Arc::new(
            MemoryCache::builder(10)
                .create(move |_| {
                    let value = counter.fetch_add(1, Ordering::SeqCst);
                    gate.wait();
                    Some(value)
                })
                .on_removed(move |evicted, _, old: &usize, new: Option<&usize>| {
                    sink.lock().push((evicted, *old, new.copied()));
                })
                .build()
                .unwrap(),
        );

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.get("shared"))
            })
            .collect();
        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();

        assert_eq!(results[0], results[1]);
        let winner = results[0];
        let loser = if winner == 100 { 101 } else { 100 };

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("shared"), Some(winner));
        assert_eq!(cache.create_count(), 2);
        assert_eq!(*removals.lock(), vec![(false, loser, Some(winner))]);
    }

    #[test]
    fn test_concurrent_puts_respect_budget() {
        let cache: Arc<MemoryCache<String, u32>> = Arc::new(MemoryCache::new(16).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        cache.put(format!("{t}-{i}"), i);
                        cache.get(&format!("{t}-{}", i / 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.size() <= 16);
        assert_eq!(cache.size(), cache.len());
        assert_eq!(cache.stats().eviction_count, 800 - cache.len() as u64);
    }
}
