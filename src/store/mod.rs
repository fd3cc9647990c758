pub mod sharded;

pub use sharded::ShardedMap;
