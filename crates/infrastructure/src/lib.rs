pub mod cache;
pub mod database;
pub mod factory;
pub mod in_memory_queue;
pub mod lock_manager;
pub mod stream;

pub use cache::{InMemoryCacheProvider, RedisCacheProvider};
pub use database::{
    DocumentTaskStorage, InMemoryTaskCollection, SqliteTaskStorage, TaskCollection, TaskFilter,
};
pub use factory::{CacheFactory, StorageFactory};
pub use in_memory_queue::InMemoryActiveQueue;
pub use lock_manager::{LockManager, LOCK_PREFIX};
pub use stream::{CacheShardLeaser, InMemoryPartitionedStream, INSTANCE_PREFIX};
