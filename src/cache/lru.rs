//! Thread-safe least-recently-used cache with background eviction.
//!
//! The cache pairs a sharded map (key lookup) with an
//! [`LruList`](crate::ds::LruList) (recency order). Writers and readers of
//! disjoint keys never serialise on a global lock: map access contends per
//! shard, list access per node, and eviction runs on its own worker thread.
//!
//! ## Architecture
//!
//! ```text
//!   LruCache<V>
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │ items: ShardedMap<String, Arc<CacheEntry>>                       │
//!   │                                                                  │
//!   │   key ──► CacheEntry { key, value, node ─┐ }                     │
//!   │                        ▲                 │                       │
//!   │                        └─────────────────┼──── element value     │
//!   │                                          ▼                       │
//!   │ evict: LruList<Arc<CacheEntry>>   front = recent, back = stale   │
//!   │                                                                  │
//!   │ len: AtomicI64     capacity: AtomicUsize (0 once closed)         │
//!   │ cleanup: Mutex + Condvar ──► eviction worker thread              │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Eviction
//!
//! `add` bumps `len` for every true insert and signals the worker when `len`
//! exceeds capacity. The worker claims one eviction at a time by CAS-ing
//! `len` downwards, so concurrent `add`s observe the shrinking length
//! immediately instead of piling up on the cleanup mutex. With a claim in
//! hand it pops the list tail and removes the map entry only if the stored
//! entry is still the exact entry it popped; a replacement written in the
//! meantime survives. An empty pop returns the claim (`len += 1`) and the
//! worker goes around.
//!
//! ## Ordering guarantees
//!
//! `len` may transiently exceed capacity. Recency updates ride the list's
//! asynchronous insertions, so the order effect of an `add` or `get` may lag
//! the call. No total order is promised across keys. `close` drains every
//! entry through the worker and is the happens-before barrier for prior
//! `add`s.
//!
//! ## Example
//!
//! ```
//! use lrukit::cache::LruCache;
//!
//! let cache: LruCache<String> = LruCache::new(64).unwrap();
//! assert!(!cache.add("k", "v".to_string()));
//! assert_eq!(cache.peek("k").as_deref(), Some(&"v".to_string()));
//! assert!(cache.contains("k"));
//! assert_eq!(cache.len(), 1);
//! cache.close();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::ds::{LruElement, LruList};
use crate::error::ConfigError;
use crate::store::ShardedMap;

/// Callback invoked once per evicted entry, outside all cache locks. It must
/// not re-enter the cache for the same key.
pub type EvictCallback<V> = Box<dyn Fn(&str, &Arc<V>) + Send + Sync>;

/// Map value for one key. The recency-list element holds the same `Arc`, and
/// that shared identity is what the eviction predicate compares.
struct CacheEntry<V> {
    key: String,
    value: Mutex<Arc<V>>,
    node: Mutex<Option<LruElement<EntryRef<V>>>>,
}

type EntryRef<V> = Arc<CacheEntry<V>>;

struct CacheShared<V> {
    /// Set to 0 by `close` to drain the cache.
    capacity: AtomicUsize,
    /// Logical entry count; may transiently exceed `capacity`.
    len: AtomicI64,
    items: ShardedMap<String, EntryRef<V>>,
    evict: LruList<EntryRef<V>>,
    on_evict: Option<EvictCallback<V>>,
    cleanup_lock: Mutex<()>,
    cleanup_cvar: Condvar,
}

impl<V> CacheShared<V> {
    fn run_cleanup(&self) {
        let mut guard = self.cleanup_lock.lock();
        loop {
            loop {
                let cap = self.capacity.load(Ordering::SeqCst) as i64;
                let n = self.len.load(Ordering::SeqCst);
                if n <= cap {
                    break;
                }
                // claim one eviction by decrementing the counter, then let
                // other threads test and claim while the pop proceeds
                if self
                    .len
                    .compare_exchange(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    continue;
                }
                drop(guard);
                self.evict_one();
                guard = self.cleanup_lock.lock();
            }
            if self.capacity.load(Ordering::SeqCst) == 0 {
                return;
            }
            // nothing to clean for now; the claim loop rechecks on wake
            self.cleanup_cvar.wait(&mut guard);
        }
    }

    fn evict_one(&self) {
        match self.evict.pop_back() {
            Some(node) => {
                if let Some(entry) = node.take_value() {
                    // drop the map entry only if it still is this exact
                    // entry; a replacement written between the pop and the
                    // removal survives
                    self.items
                        .remove_cb(entry.key.as_str(), |_, stored| Arc::ptr_eq(stored, &entry));
                    let value = entry.value.lock().clone();
                    if let Some(on_evict) = &self.on_evict {
                        on_evict(&entry.key, &value);
                    }
                    entry.node.lock().take();
                }
            }
            None => {
                // pop failed: return the claimed eviction and retry later
                self.len.fetch_add(1, Ordering::SeqCst);
                thread::yield_now();
            }
        }
    }
}

/// Thread-safe LRU cache of `String` keys to shared values.
///
/// Entries past `capacity` are reclaimed by a background worker; `len` can
/// briefly exceed the capacity between an insert and the matching eviction.
pub struct LruCache<V> {
    shared: Arc<CacheShared<V>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Send + Sync + 'static> LruCache<V> {
    /// Creates a cache holding up to `capacity` entries. Rejects a zero
    /// capacity.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        Self::with_evict(capacity, None)
    }

    /// Creates a cache that reports every eviction to `on_evict`. Rejects a
    /// zero capacity.
    pub fn with_evict(
        capacity: usize,
        on_evict: Option<EvictCallback<V>>,
    ) -> Result<Self, ConfigError> {
        Self::with_parts(capacity, default_shard_count(), on_evict)
    }

    pub(crate) fn with_parts(
        capacity: usize,
        shards: usize,
        on_evict: Option<EvictCallback<V>>,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::new("must provide a positive size"));
        }

        let shared = Arc::new(CacheShared {
            capacity: AtomicUsize::new(capacity),
            len: AtomicI64::new(0),
            items: ShardedMap::new(shards),
            evict: LruList::new(),
            on_evict,
            cleanup_lock: Mutex::new(()),
            cleanup_cvar: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = thread::spawn(move || worker_shared.run_cleanup());

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl<V> LruCache<V> {
    /// Inserts `value` under `key`, refreshing the key's recency. Returns
    /// `true` when the insert pushed the cache over capacity and an eviction
    /// was scheduled; updates of an existing key return `false`.
    pub fn add(&self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        let value = Arc::new(value);
        let shared = &self.shared;

        let stored = shared.items.upsert(key.clone(), |existing| {
            if let Some(entry) = existing {
                let node = entry.node.lock().clone();
                if let Some(node) = node {
                    // if the move to front fails the entry is mid-eviction,
                    // so fall through to a fresh entry
                    if shared.evict.move_to_front(&node) {
                        *entry.value.lock() = value.clone();
                        return entry.clone();
                    }
                }
            }
            Arc::new(CacheEntry {
                key: key.clone(),
                value: Mutex::new(value.clone()),
                node: Mutex::new(None),
            })
        });

        let mut node_slot = stored.node.lock();
        if node_slot.is_none() {
            // a true insert: count it and put it on the recency list
            let guard = shared.cleanup_lock.lock();
            let n = shared.len.fetch_add(1, Ordering::SeqCst) + 1;
            *node_slot = Some(shared.evict.push_front(stored.clone()));
            drop(node_slot);
            if n > shared.capacity.load(Ordering::SeqCst) as i64 {
                // actual cleanup happens in the background
                shared.cleanup_cvar.notify_one();
                drop(guard);
                return true;
            }
        }
        false
    }

    /// Returns the value for `key` and refreshes its recency. An entry whose
    /// eviction is already in flight counts as absent.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let entry = self.shared.items.get(key)?;
        let node = entry.node.lock().clone()?;
        if self.shared.evict.move_to_front(&node) {
            Some(entry.value.lock().clone())
        } else {
            None
        }
    }

    /// Returns the value for `key` without touching its recency.
    pub fn peek(&self, key: &str) -> Option<Arc<V>> {
        self.shared
            .items
            .get(key)
            .map(|entry| entry.value.lock().clone())
    }

    /// Returns `true` if `key` is cached, without touching its recency.
    pub fn contains(&self, key: &str) -> bool {
        self.shared.items.contains(key)
    }

    /// Returns the number of cached entries. O(1), eventually consistent
    /// with the completed insert/eviction pairs.
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::SeqCst).max(0) as usize
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured capacity; 0 once the cache is closed.
    pub fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::SeqCst)
    }

    /// Drains the cache and stops the eviction worker. Every resident entry
    /// is reported to the eviction callback before this returns. Idempotent;
    /// also run on drop.
    pub fn close(&self) {
        {
            let _guard = self.shared.cleanup_lock.lock();
            self.shared.capacity.store(0, Ordering::SeqCst);
            self.shared.cleanup_cvar.notify_all();
        }
        self.shared.evict.close();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl<V> fmt::Debug for LruCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<V> Drop for LruCache<V> {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::yield_now();
        }
    }

    fn counting_callback<V>(counter: &Arc<AtomicUsize>) -> Option<EvictCallback<V>> {
        let counter = counter.clone();
        Some(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = LruCache::<i32>::new(0).unwrap_err();
        assert_eq!(err.to_string(), "must provide a positive size");
    }

    #[test]
    fn add_get_peek_round_trip() {
        let cache = LruCache::new(8).unwrap();
        assert!(!cache.add("a", 1));

        assert_eq!(cache.get("a").as_deref(), Some(&1));
        assert_eq!(cache.peek("a").as_deref(), Some(&1));
        assert!(cache.contains("a"));
        assert_eq!(cache.len(), 1);

        assert!(cache.get("missing").is_none());
        assert!(cache.peek("missing").is_none());
        assert!(!cache.contains("missing"));
    }

    #[test]
    fn add_on_hit_updates_value_in_place() {
        let cache = LruCache::new(8).unwrap();
        assert!(!cache.add("a", 1));
        assert!(!cache.add("a", 2));

        assert_eq!(cache.peek("a").as_deref(), Some(&2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.shared.items.len(), 1);
        // the recency list holds one element for the key
        cache.shared.evict.wait_for_insertions();
        assert_eq!(cache.shared.evict.len(), 1);
    }

    #[test]
    fn add_past_capacity_reports_eviction() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let cache = LruCache::with_evict(1, counting_callback(&evictions)).unwrap();

        assert!(!cache.add("1", 1));
        assert!(cache.add("2", 2));

        wait_until("the eviction to land", || {
            evictions.load(Ordering::SeqCst) == 1
        });
        wait_until("len to settle", || cache.len() == 1);
    }

    #[test]
    fn eviction_respects_recency() {
        let cache = LruCache::new(2).unwrap();
        assert!(!cache.add("a", "a".to_string()));
        assert!(!cache.add("b", "b".to_string()));
        cache.shared.evict.wait_for_insertions();

        // refresh "a" so "b" is the stalest entry
        assert!(cache.get("a").is_some());
        cache.shared.evict.wait_for_insertions();

        assert!(cache.add("c", "c".to_string()));
        wait_until("the stale entry to be evicted", || {
            cache.len() == 2 && !cache.contains("b")
        });
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn close_drains_every_entry() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let cache = LruCache::with_evict(8, counting_callback(&evictions)).unwrap();
        for i in 0..5 {
            assert!(!cache.add(i.to_string(), i));
        }

        cache.close();
        assert_eq!(evictions.load(Ordering::SeqCst), 5);
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.shared.items.len(), 0);
        assert_eq!(cache.capacity(), 0);
        assert!(!cache.contains("0"));
    }

    #[test]
    fn close_is_idempotent() {
        let cache = LruCache::new(4).unwrap();
        cache.add("a", 1);
        cache.close();
        cache.close();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn get_of_closed_cache_misses() {
        let cache = LruCache::new(4).unwrap();
        cache.add("a", 1);
        cache.close();
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn callback_receives_key_and_value() {
        let seen: Arc<Mutex<Vec<(String, i32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cache = LruCache::with_evict(
            1,
            Some(Box::new(move |key: &str, value: &Arc<i32>| {
                sink.lock().push((key.to_string(), **value));
            })),
        )
        .unwrap();

        cache.add("1", 1);
        cache.add("2", 2);

        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.lock().is_empty() {
            assert!(Instant::now() < deadline, "eviction callback never ran");
            thread::yield_now();
        }
        assert_eq!(seen.lock().first(), Some(&("1".to_string(), 1)));
    }
}
