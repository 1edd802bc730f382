pub mod memory_cache;
pub mod redis_cache;

pub use memory_cache::InMemoryCacheProvider;
pub use redis_cache::RedisCacheProvider;
