//! 基于共享缓存的分布式锁
//!
//! 锁值记录持有者id，只有持有者可以释放或续期。释放与续期是"先读后写"
//! 两步完成的，在持有者TTL边界上可能误删他人刚获得的锁，调用方需要把
//! TTL设置得明显长于一次操作的耗时。

use std::sync::Arc;
use std::time::Duration;

use taskq_core::{CacheProvider, QueueResult};
use tracing::{debug, warn};

/// 所有锁键的公共前缀
pub const LOCK_PREFIX: &str = "mq-lock:";

#[derive(Clone)]
pub struct LockManager {
    cache: Arc<dyn CacheProvider>,
    owner: String,
}

impl LockManager {
    pub fn new(cache: Arc<dyn CacheProvider>, owner: impl Into<String>) -> Self {
        Self {
            cache,
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn cache(&self) -> &Arc<dyn CacheProvider> {
        &self.cache
    }

    fn key(name: &str) -> String {
        format!("{LOCK_PREFIX}{name}")
    }

    /// 尝试获取锁，不等待
    ///
    /// 锁已由本持有者持有时刷新TTL并返回 true。
    pub async fn acquire(&self, name: &str, ttl: Duration) -> QueueResult<bool> {
        let key = Self::key(name);
        if self.cache.set_nx(&key, &self.owner, ttl).await? {
            debug!("获取锁成功: {}", key);
            return Ok(true);
        }
        if self.cache.get(&key).await?.as_deref() == Some(self.owner.as_str()) {
            return self.cache.expire(&key, ttl).await;
        }
        debug!("锁已被占用: {}", key);
        Ok(false)
    }

    /// 释放锁，只有持有者可以释放
    pub async fn release(&self, name: &str) -> QueueResult<bool> {
        let key = Self::key(name);
        match self.cache.get(&key).await? {
            Some(holder) if holder == self.owner => {
                let removed = self.cache.del(&key).await?;
                debug!("释放锁: {}", key);
                Ok(removed)
            }
            Some(holder) => {
                warn!("锁 {} 由 {} 持有，拒绝释放", key, holder);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// 是否被任意持有者锁定
    pub async fn is_locked(&self, name: &str) -> QueueResult<bool> {
        Ok(self.cache.get(&Self::key(name)).await?.is_some())
    }

    /// 是否由本持有者持有
    pub async fn is_held(&self, name: &str) -> QueueResult<bool> {
        Ok(self.cache.get(&Self::key(name)).await?.as_deref() == Some(self.owner.as_str()))
    }

    /// 续期，仅持有者有效
    pub async fn extend(&self, name: &str, ttl: Duration) -> QueueResult<bool> {
        if !self.is_held(name).await? {
            return Ok(false);
        }
        self.cache.expire(&Self::key(name), ttl).await
    }
}
