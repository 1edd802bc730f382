use std::sync::Arc;

use taskq_core::config::{CacheBackend, CacheConfig, StorageBackend, StorageConfig};
use taskq_core::{CacheProvider, Clock, QueueResult, StorageAdapter};
use tracing::{debug, info};

use crate::cache::{InMemoryCacheProvider, RedisCacheProvider};
use crate::database::{DocumentTaskStorage, InMemoryTaskCollection, SqliteTaskStorage};

pub struct StorageFactory;

impl StorageFactory {
    pub async fn create(
        config: &StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Arc<dyn StorageAdapter>> {
        debug!("创建任务存储: {:?}", config.backend);

        match config.backend {
            StorageBackend::Sqlite => {
                info!("初始化SQLite任务存储");
                let storage = SqliteTaskStorage::connect(config, clock).await?;
                Ok(Arc::new(storage))
            }
            StorageBackend::Memory => {
                info!("初始化内存文档任务存储");
                let storage = DocumentTaskStorage::new(InMemoryTaskCollection::new(), clock)
                    .with_limits(config.stale_threshold(), config.mature_page_size);
                Ok(Arc::new(storage))
            }
        }
    }
}

pub struct CacheFactory;

impl CacheFactory {
    pub async fn create(config: &CacheConfig) -> QueueResult<Arc<dyn CacheProvider>> {
        debug!("创建缓存: {:?}", config.backend);

        match config.backend {
            CacheBackend::Redis => {
                info!("初始化Redis缓存");
                Ok(Arc::new(RedisCacheProvider::new(config).await?))
            }
            CacheBackend::Memory => {
                info!("初始化内存缓存");
                Ok(Arc::new(InMemoryCacheProvider::new()))
            }
        }
    }
}
