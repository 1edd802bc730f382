use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use taskq_core::{CacheProvider, QueueResult, ShardLeaser};
use tracing::debug;

use crate::lock_manager::LockManager;

/// 实例存活登记键前缀
pub const INSTANCE_PREFIX: &str = "shard-instance:";

/// 基于共享缓存的分片租约
///
/// 实例通过带TTL的心跳键登记存活，租约是 `mq-lock:shard:{stream}:{shard}` 锁，
/// 每次确认持有时续期。
pub struct CacheShardLeaser {
    cache: Arc<dyn CacheProvider>,
    locks: LockManager,
    instance_id: String,
    heartbeat_ttl: Duration,
    lease_ttl: Duration,
}

impl CacheShardLeaser {
    pub fn new(
        cache: Arc<dyn CacheProvider>,
        instance_id: impl Into<String>,
        heartbeat_ttl: Duration,
        lease_ttl: Duration,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            locks: LockManager::new(cache.clone(), instance_id.clone()),
            cache,
            instance_id,
            heartbeat_ttl,
            lease_ttl,
        }
    }

    fn instance_key(&self) -> String {
        format!("{INSTANCE_PREFIX}{}", self.instance_id)
    }

    fn lease_name(stream_id: &str, shard_id: &str) -> String {
        format!("shard:{stream_id}:{shard_id}")
    }
}

#[async_trait]
impl ShardLeaser for CacheShardLeaser {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn heartbeat(&self) -> QueueResult<()> {
        self.cache
            .set(
                &self.instance_key(),
                &Utc::now().to_rfc3339(),
                Some(self.heartbeat_ttl),
            )
            .await
    }

    async fn get_active_instances(&self) -> QueueResult<Vec<String>> {
        let mut instances: Vec<String> = self
            .cache
            .scan_prefix(INSTANCE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(INSTANCE_PREFIX).map(str::to_string))
            .collect();
        instances.sort();
        instances.dedup();
        Ok(instances)
    }

    async fn acquire_lock(&self, stream_id: &str, shard_id: &str) -> QueueResult<bool> {
        let acquired = self
            .locks
            .acquire(&Self::lease_name(stream_id, shard_id), self.lease_ttl)
            .await?;
        debug!("申请分片租约 {}/{}: {}", stream_id, shard_id, acquired);
        Ok(acquired)
    }

    async fn release_lock(&self, stream_id: &str, shard_id: &str) -> QueueResult<()> {
        self.locks
            .release(&Self::lease_name(stream_id, shard_id))
            .await?;
        Ok(())
    }

    async fn is_lock_held(&self, stream_id: &str, shard_id: &str) -> QueueResult<bool> {
        self.locks
            .extend(&Self::lease_name(stream_id, shard_id), self.lease_ttl)
            .await
    }

    async fn deregister(&self) -> QueueResult<()> {
        self.cache.del(&self.instance_key()).await?;
        Ok(())
    }
}
