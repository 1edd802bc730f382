use std::time::Duration;

use async_trait::async_trait;

use crate::QueueResult;

/// 共享缓存/锁存储的最小接口
///
/// 多个组件共用同一个后端，所有键都必须带上组件前缀（如 `mq-lock:`、
/// `task_metrics:`），任何组件都不能假设独占。
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()>;

    /// 仅当键不存在时写入，返回是否写入成功
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool>;

    async fn del(&self, key: &str) -> QueueResult<bool>;

    /// 刷新过期时间，键不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> QueueResult<i64>;

    /// 列出以 prefix 开头的所有键
    async fn scan_prefix(&self, prefix: &str) -> QueueResult<Vec<String>>;
}
