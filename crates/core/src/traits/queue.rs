use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::Task;
use crate::QueueResult;

/// 活跃队列：保存即将执行的任务
///
/// 任务只有在 execute_at <= now 时才会被取出；同一id的任务重复入队会被去重。
#[async_trait]
pub trait ActiveQueue: Send + Sync {
    /// 入队，返回实际入队的数量
    async fn enqueue(&self, queue_id: &str, tasks: Vec<Task>) -> QueueResult<usize>;

    /// 取出最多 max 个已到期任务，按 execute_at 升序
    async fn dequeue_batch(
        &self,
        queue_id: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<Task>>;

    async fn len(&self, queue_id: &str) -> QueueResult<usize>;
}
