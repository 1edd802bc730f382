//! 任务存储适配器接口
//!
//! 任意后端（文档存储、关系型数据库等）都必须完整实现此接口，包括
//! `get_mature_tasks` 的两阶段语义：先把卡在 processing 状态过久的任务
//! 恢复为 scheduled，再认领一页到期任务并原子地标记为 processing。
//!
//! 批量写入遵循"单条失败不影响整批"的语义：重复键冲突等个别错误被跳过，
//! 只有系统性错误才会返回给调用方。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CleanupStats, Task, TaskUpdate};
use crate::QueueResult;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// 批量写入待调度任务，返回实际持久化的子集
    async fn add_tasks_to_scheduled(&self, tasks: &[Task]) -> QueueResult<Vec<Task>>;

    /// 恢复超时任务并认领到期任务
    async fn get_mature_tasks(&self, now: DateTime<Utc>) -> QueueResult<Vec<Task>>;

    async fn mark_tasks_as_processing(
        &self,
        tasks: &[Task],
        started_at: DateTime<Utc>,
    ) -> QueueResult<u64>;

    /// 标记为已执行，任务上携带的 execution_result 会一并保存
    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> QueueResult<u64>;

    async fn mark_tasks_as_failed(&self, tasks: &[Task]) -> QueueResult<u64>;

    async fn mark_tasks_as_ignored(&self, tasks: &[Task]) -> QueueResult<u64>;

    async fn mark_tasks_as_expired(&self, tasks: &[Task]) -> QueueResult<u64>;

    /// 部分更新，返回实际命中的任务id
    async fn update_tasks(&self, updates: &[TaskUpdate]) -> QueueResult<Vec<String>>;

    /// 按id插入或更新，created_at 仅在插入时写入
    async fn upsert_tasks(&self, tasks: &[Task]) -> QueueResult<Vec<Task>>;

    async fn get_tasks_by_ids(&self, ids: &[String]) -> QueueResult<Vec<Task>>;

    async fn get_cleanup_stats(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats>;

    async fn cleanup_tasks(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats>;

    fn generate_id(&self) -> String;
}

/// 仅保留带id的任务的id列表
pub fn task_ids(tasks: &[Task]) -> Vec<String> {
    tasks.iter().filter_map(|t| t.id.clone()).collect()
}
