//! Test helper utilities and common testing patterns

use std::sync::Arc;
use std::time::Duration;

use taskq_core::config::{StorageBackend, StorageConfig};
use taskq_core::{CacheProvider, Clock};
use taskq_infrastructure::{
    DocumentTaskStorage, InMemoryActiveQueue, InMemoryCacheProvider, InMemoryTaskCollection,
    LockManager, SqliteTaskStorage,
};
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Polls `condition` every 10ms until it holds or `timeout` passes
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition().await
    }
}

/// In-memory sqlite storage with migrations applied
pub async fn setup_test_storage(clock: Arc<dyn Clock>) -> SqliteTaskStorage {
    let config = StorageConfig {
        backend: StorageBackend::Sqlite,
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        ..Default::default()
    };
    SqliteTaskStorage::connect(&config, clock)
        .await
        .expect("failed to set up in-memory sqlite storage")
}

/// Document storage over an in-memory collection
pub fn setup_document_storage(
    clock: Arc<dyn Clock>,
) -> DocumentTaskStorage<InMemoryTaskCollection> {
    DocumentTaskStorage::new(InMemoryTaskCollection::new(), clock)
}

/// Shared in-memory cache plus a lock manager owned by `owner`
pub fn setup_locks(owner: &str) -> (Arc<dyn CacheProvider>, LockManager) {
    let cache: Arc<dyn CacheProvider> = Arc::new(InMemoryCacheProvider::new());
    let locks = LockManager::new(cache.clone(), owner);
    (cache, locks)
}

pub fn setup_active_queue() -> Arc<InMemoryActiveQueue> {
    Arc::new(InMemoryActiveQueue::new())
}
