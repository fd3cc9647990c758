//! Cache construction with optional tuning knobs.
//!
//! [`LruCache::new`](crate::cache::LruCache::new) covers the common case;
//! the builder adds the shard count and the eviction callback without
//! growing the constructor surface.
//!
//! ## Example
//!
//! ```
//! use lrukit::builder::CacheBuilder;
//!
//! let cache = CacheBuilder::<String>::new(128)
//!     .shards(8)
//!     .on_evict(|key, _value| {
//!         let _ = key;
//!     })
//!     .try_build()
//!     .unwrap();
//!
//! cache.add("k", "v".to_string());
//! assert_eq!(cache.len(), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::cache::lru::default_shard_count;
use crate::cache::{EvictCallback, LruCache};
use crate::error::ConfigError;

/// Configures and builds an [`LruCache`].
pub struct CacheBuilder<V> {
    capacity: usize,
    shards: Option<usize>,
    on_evict: Option<EvictCallback<V>>,
}

impl<V: Send + Sync + 'static> CacheBuilder<V> {
    /// Starts a builder for a cache holding up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shards: None,
            on_evict: None,
        }
    }

    /// Sets the shard count of the backing map. Defaults to the available
    /// parallelism; clamped to at least 1.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Installs a callback invoked once per evicted entry, outside all cache
    /// locks.
    pub fn on_evict(mut self, callback: impl Fn(&str, &Arc<V>) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(callback));
        self
    }

    /// Validates the configuration and builds the cache. A zero capacity is
    /// rejected.
    pub fn try_build(self) -> Result<LruCache<V>, ConfigError> {
        let shards = self.shards.unwrap_or_else(default_shard_count);
        LruCache::with_parts(self.capacity, shards, self.on_evict)
    }
}

impl<V> fmt::Debug for CacheBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("capacity", &self.capacity)
            .field("shards", &self.shards)
            .field("on_evict", &self.on_evict.is_some())
            .finish()
    }
}
