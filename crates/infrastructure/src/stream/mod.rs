pub mod cache_shard_leaser;
pub mod in_memory_stream;

pub use cache_shard_leaser::{CacheShardLeaser, INSTANCE_PREFIX};
pub use in_memory_stream::InMemoryPartitionedStream;
