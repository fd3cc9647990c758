pub use crate::builder::CacheBuilder;
pub use crate::cache::{EvictCallback, LruCache};
pub use crate::ds::{Element, LinkedList, LruElement, LruList};
pub use crate::error::{ConfigError, InvariantError};
pub use crate::store::ShardedMap;
