//! Sharded concurrent hash map with atomic merge and conditional removal.
//!
//! Keys are distributed across independent shards, each guarded by its own
//! `RwLock`. Operations on different shards proceed fully in parallel; the
//! per-key operations a caller composes ([`upsert`](ShardedMap::upsert),
//! [`remove_cb`](ShardedMap::remove_cb)) run their callback under the shard's
//! write lock, atomically with the store or delete they decide.
//!
//! ## Architecture
//!
//! ```text
//!   ShardedMap<K, V>
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │  shard_index(key) = DefaultHasher(seed, key) % shards       │
//!   │                                                             │
//!   │  ┌───────────┬───────────┬───────────┬───────────┐          │
//!   │  │ RwLock    │ RwLock    │ RwLock    │ RwLock    │          │
//!   │  │ FxHashMap │ FxHashMap │ FxHashMap │ FxHashMap │          │
//!   │  └───────────┴───────────┴───────────┴───────────┘          │
//!   │                                                             │
//!   │  size: AtomicUsize (total entries across shards)            │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shard selection hashes with a seeded `DefaultHasher` while the shard maps
//! bucket with `FxHashMap`, so shard choice and in-shard bucketing do not
//! correlate.
//!
//! ## Example Usage
//!
//! ```
//! use lrukit::store::ShardedMap;
//!
//! let map: ShardedMap<&str, i32> = ShardedMap::new(4);
//!
//! // merge runs under the shard lock, atomically with the store
//! map.upsert("counter", |old| old.copied().unwrap_or(0) + 1);
//! map.upsert("counter", |old| old.copied().unwrap_or(0) + 1);
//! assert_eq!(map.get(&"counter"), Some(2));
//!
//! // conditional removal: the predicate decides under the same lock
//! let removed = map.remove_cb(&"counter", |_, v| *v == 2);
//! assert_eq!(removed, Some(2));
//! assert!(map.is_empty());
//! ```

use std::borrow::Borrow;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Concurrent hash map with per-shard locking.
///
/// Values are cloned out on access, so `V` is typically a cheap handle such
/// as an `Arc`.
pub struct ShardedMap<K, V> {
    shards: Vec<RwLock<FxHashMap<K, V>>>,
    size: AtomicUsize,
    seed: u64,
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates a map with `shards` shards (clamped to at least 1) and seed 0.
    pub fn new(shards: usize) -> Self {
        Self::with_seed(shards, 0)
    }

    /// Creates a map with `shards` shards and the given shard-selection
    /// seed. The same `(key, seed, shards)` always maps to the same shard.
    pub fn with_seed(shards: usize, seed: u64) -> Self {
        let count = shards.max(1);
        let mut shard_vec = Vec::with_capacity(count);
        for _ in 0..count {
            shard_vec.push(RwLock::new(FxHashMap::default()));
        }
        Self {
            shards: shard_vec,
            size: AtomicUsize::new(0),
            seed,
        }
    }

    /// Returns the number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the total number of entries.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `key` is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        self.shards[idx].read().contains_key(key)
    }

    /// Returns a clone of the value for `key`, if present.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let idx = self.shard_index(key);
        self.shards[idx].read().get(key).cloned()
    }

    /// Inserts or updates `key` through `merge`, atomically with respect to
    /// every other operation on the key.
    ///
    /// `merge` receives the current value (`None` on a miss) and returns the
    /// value to store; it runs under the shard's write lock. Returns a clone
    /// of the stored value.
    pub fn upsert<F>(&self, key: K, merge: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
        V: Clone,
    {
        let idx = self.shard_index(&key);
        let mut shard = self.shards[idx].write();
        match shard.entry(key) {
            Entry::Occupied(mut occupied) => {
                let merged = merge(Some(occupied.get()));
                occupied.insert(merged.clone());
                merged
            }
            Entry::Vacant(vacant) => {
                let merged = merge(None);
                vacant.insert(merged.clone());
                self.size.fetch_add(1, Ordering::Relaxed);
                merged
            }
        }
    }

    /// Removes `key` only if `predicate` approves the currently stored
    /// value. The predicate runs under the shard's write lock, so the value
    /// it sees is the value that gets removed. Returns the removed value.
    ///
    /// Absent keys are never passed to the predicate and report `None`.
    pub fn remove_cb<Q, F>(&self, key: &Q, predicate: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&Q, &V) -> bool,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].write();
        let approved = match shard.get(key) {
            Some(value) => predicate(key, value),
            None => false,
        };
        if !approved {
            return None;
        }
        let removed = shard.remove(key);
        if removed.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes `key` unconditionally. Returns the removed value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.shard_index(key);
        let removed = self.shards[idx].write().remove(key);
        if removed.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes every entry. Holds all shard locks for the duration so the
    /// map is observably empty afterwards.
    pub fn clear(&self) {
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            guards.push(shard.write());
        }
        for guard in guards.iter_mut() {
            guard.clear();
        }
        self.size.store(0, Ordering::Relaxed);
    }

    fn shard_index<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

impl<K, V> Default for ShardedMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates a map with one shard per available CPU.
    fn default() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::new(shards)
    }
}

impl<K, V> fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shards.len())
            .field("len", &self.size.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_ops() {
        let map: ShardedMap<&str, String> = ShardedMap::new(4);
        assert!(map.is_empty());

        map.upsert("k1", |_| "v1".to_string());
        assert_eq!(map.get(&"k1"), Some("v1".to_string()));
        assert!(map.contains(&"k1"));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(&"k1"), Some("v1".to_string()));
        assert!(!map.contains(&"k1"));
        assert!(map.is_empty());
    }

    #[test]
    fn upsert_merge_sees_current_value() {
        let map: ShardedMap<&str, i32> = ShardedMap::new(2);

        let stored = map.upsert("k", |old| {
            assert!(old.is_none());
            1
        });
        assert_eq!(stored, 1);

        let stored = map.upsert("k", |old| {
            assert_eq!(old, Some(&1));
            2
        });
        assert_eq!(stored, 2);
        assert_eq!(map.get(&"k"), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_cb_respects_predicate() {
        let map: ShardedMap<&str, i32> = ShardedMap::new(2);
        map.upsert("k", |_| 10);

        // predicate rejects: entry stays
        assert_eq!(map.remove_cb(&"k", |_, v| *v == 99), None);
        assert!(map.contains(&"k"));

        // predicate approves: entry goes
        assert_eq!(map.remove_cb(&"k", |_, v| *v == 10), Some(10));
        assert!(!map.contains(&"k"));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn remove_cb_missing_key_skips_predicate() {
        let map: ShardedMap<&str, i32> = ShardedMap::new(2);
        let removed = map.remove_cb(&"missing", |_, _| {
            panic!("predicate must not run for absent keys")
        });
        assert_eq!(removed, None);
    }

    #[test]
    fn clear_resets_all_shards() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(4);
        for i in 0..32 {
            map.upsert(i, |_| i);
        }
        assert_eq!(map.len(), 32);

        map.clear();
        assert!(map.is_empty());
        for i in 0..32 {
            assert!(!map.contains(&i));
        }
    }

    #[test]
    fn zero_shards_clamps_to_one() {
        let map: ShardedMap<u32, u32> = ShardedMap::new(0);
        assert_eq!(map.shard_count(), 1);
        map.upsert(1, |_| 1);
        assert_eq!(map.get(&1), Some(1));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    // =============================================================================
    // Property Tests - Upsert / Get round trips
    // =============================================================================

    proptest! {
        /// Property: every upserted key is retrievable with its last value
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_upsert_get_round_trip(
            shard_count in 1usize..16,
            seed in any::<u64>(),
            entries in prop::collection::vec((any::<u32>(), any::<u32>()), 0..100)
        ) {
            let map: ShardedMap<u32, u32> = ShardedMap::with_seed(shard_count, seed);
            let mut expected = std::collections::HashMap::new();

            for (k, v) in &entries {
                map.upsert(*k, |_| *v);
                expected.insert(*k, *v);
            }

            for (k, v) in &expected {
                prop_assert_eq!(map.get(k), Some(*v));
            }
            prop_assert_eq!(map.len(), expected.len());
        }

        /// Property: merge observes exactly the previously stored value
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_merge_sees_previous(
            shard_count in 1usize..16,
            key in any::<u32>(),
            updates in prop::collection::vec(any::<u32>(), 1..20)
        ) {
            let map: ShardedMap<u32, u32> = ShardedMap::new(shard_count);
            let mut previous: Option<u32> = None;

            for v in &updates {
                let expect = previous;
                map.upsert(key, |old| {
                    assert_eq!(old.copied(), expect);
                    *v
                });
                previous = Some(*v);
            }

            prop_assert_eq!(map.get(&key), previous);
            prop_assert_eq!(map.len(), 1);
        }
    }

    // =============================================================================
    // Property Tests - Removal
    // =============================================================================

    proptest! {
        /// Property: removing every inserted key empties the map
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_remove_all_empties(
            shard_count in 1usize..16,
            keys in prop::collection::hash_set(any::<u32>(), 0..100)
        ) {
            let map: ShardedMap<u32, u32> = ShardedMap::new(shard_count);
            for k in &keys {
                map.upsert(*k, |_| *k);
            }
            prop_assert_eq!(map.len(), keys.len());

            for k in &keys {
                prop_assert_eq!(map.remove(k), Some(*k));
            }
            prop_assert!(map.is_empty());
        }

        /// Property: a rejecting predicate never removes anything
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_rejecting_predicate_preserves(
            shard_count in 1usize..16,
            keys in prop::collection::hash_set(any::<u32>(), 0..50)
        ) {
            let map: ShardedMap<u32, u32> = ShardedMap::new(shard_count);
            for k in &keys {
                map.upsert(*k, |_| *k);
            }

            for k in &keys {
                prop_assert_eq!(map.remove_cb(k, |_, _| false), None);
            }
            prop_assert_eq!(map.len(), keys.len());
        }
    }
}
