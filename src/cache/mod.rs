pub mod lru;

pub use lru::{EvictCallback, LruCache};
