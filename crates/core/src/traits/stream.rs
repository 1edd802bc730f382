use async_trait::async_trait;

use crate::models::RecordBatch;
use crate::QueueResult;

/// 分区流客户端（类 Kinesis），作为外部依赖只定义接口
#[async_trait]
pub trait PartitionedStream: Send + Sync {
    /// 列出流的所有分片
    async fn list_shards(&self, stream_id: &str) -> QueueResult<Vec<String>>;

    /// 拉取 after_sequence 之后最多 limit 条记录
    async fn get_records(
        &self,
        stream_id: &str,
        shard_id: &str,
        after_sequence: Option<&str>,
        limit: usize,
    ) -> QueueResult<RecordBatch>;
}

/// 分片租约与实例存活发现
#[async_trait]
pub trait ShardLeaser: Send + Sync {
    fn instance_id(&self) -> &str;

    /// 上报本实例存活
    async fn heartbeat(&self) -> QueueResult<()>;

    /// 当前存活实例id（已排序）
    async fn get_active_instances(&self) -> QueueResult<Vec<String>>;

    async fn acquire_lock(&self, stream_id: &str, shard_id: &str) -> QueueResult<bool>;

    async fn release_lock(&self, stream_id: &str, shard_id: &str) -> QueueResult<()>;

    /// 检查租约是否仍由本实例持有，持有时顺带续期
    async fn is_lock_held(&self, stream_id: &str, shard_id: &str) -> QueueResult<bool>;

    /// 从存活列表中移除本实例
    async fn deregister(&self) -> QueueResult<()>;
}
