use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskq_core::config::StorageConfig;
use taskq_core::{
    task_ids, CleanupStats, Clock, QueueResult, StorageAdapter, Task, TaskPatch, TaskStatus,
    TaskUpdate,
};
use tracing::{debug, info, instrument, warn};

use super::collection::{TaskCollection, TaskFilter};

/// 基于文档集合的任务存储
///
/// 认领到期任务分三步：查找一页到期任务、以 status=scheduled 为条件批量
/// 更新为 processing 并打上本次认领时间、再按id与认领时间读回。没有被本次
/// 更新命中的任务（被其他调用方抢先认领）不会返回。
pub struct DocumentTaskStorage<C: TaskCollection> {
    collection: C,
    clock: Arc<dyn Clock>,
    stale_threshold: chrono::Duration,
    page_size: usize,
}

impl<C: TaskCollection> DocumentTaskStorage<C> {
    pub fn new(collection: C, clock: Arc<dyn Clock>) -> Self {
        let defaults = StorageConfig::default();
        Self {
            collection,
            clock,
            stale_threshold: defaults.stale_threshold(),
            page_size: defaults.mature_page_size,
        }
    }

    pub fn with_limits(mut self, stale_threshold: chrono::Duration, page_size: usize) -> Self {
        self.stale_threshold = stale_threshold;
        self.page_size = page_size.max(1);
        self
    }

    pub fn collection(&self) -> &C {
        &self.collection
    }

    async fn transition(
        &self,
        tasks: &[Task],
        target: TaskStatus,
        allowed_from: &[TaskStatus],
    ) -> QueueResult<u64> {
        let ids = task_ids(tasks);
        if ids.is_empty() {
            return Ok(0);
        }
        let mut statuses = allowed_from.to_vec();
        statuses.push(target);

        let filter = TaskFilter::by_ids(ids).with_statuses(&statuses);
        self.collection
            .update_many(&filter, &TaskPatch::status(target), self.clock.now())
            .await
    }

    fn cleanup_filters(
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> (TaskFilter, TaskFilter) {
        let orphaned = TaskFilter {
            statuses: Some(vec![TaskStatus::Processing]),
            processing_started_before: Some(orphaned_before),
            ..Default::default()
        };
        let expired = TaskFilter {
            statuses: Some(TaskStatus::terminal_states().to_vec()),
            updated_before: Some(expired_before),
            ..Default::default()
        };
        (orphaned, expired)
    }
}

#[async_trait]
impl<C: TaskCollection> StorageAdapter for DocumentTaskStorage<C> {
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn add_tasks_to_scheduled(&self, tasks: &[Task]) -> QueueResult<Vec<Task>> {
        let now = self.clock.now();
        let mut persisted = Vec::with_capacity(tasks.len());

        for task in tasks {
            let mut task = task.clone();
            if task.id.is_none() {
                task.id = Some(self.generate_id());
            }
            task.status = TaskStatus::Scheduled;
            task.processing_started_at = None;
            task.updated_at = now;

            if self.collection.insert_one(task.clone()).await? {
                persisted.push(task);
            } else {
                debug!("任务 {} 已存在，跳过", task.describe());
            }
        }

        Ok(persisted)
    }

    #[instrument(skip(self))]
    async fn get_mature_tasks(&self, now: DateTime<Utc>) -> QueueResult<Vec<Task>> {
        let current = self.clock.now();

        let stale = TaskFilter {
            statuses: Some(vec![TaskStatus::Processing]),
            processing_started_before: Some(current - self.stale_threshold),
            ..Default::default()
        };
        let reset_patch = TaskPatch {
            status: Some(TaskStatus::Scheduled),
            processing_started_at: Some(None),
            ..Default::default()
        };
        let reset = self
            .collection
            .update_many(&stale, &reset_patch, current)
            .await?;
        if reset > 0 {
            warn!("{} 个任务长时间停留在processing状态，已重新调度", reset);
            metrics::counter!("taskq_stale_tasks_recovered_total", "backend" => "memory")
                .increment(reset);
        }

        let due = TaskFilter {
            statuses: Some(vec![TaskStatus::Scheduled]),
            execute_at_lte: Some(now),
            ..Default::default()
        };
        let candidates = self.collection.find(&due, Some(self.page_size)).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let claim = TaskFilter::by_ids(task_ids(&candidates)).with_statuses(&[TaskStatus::Scheduled]);
        let claim_patch = TaskPatch {
            status: Some(TaskStatus::Processing),
            processing_started_at: Some(Some(current)),
            ..Default::default()
        };
        self.collection
            .update_many(&claim, &claim_patch, current)
            .await?;

        let claimed = TaskFilter {
            ids: Some(task_ids(&candidates)),
            statuses: Some(vec![TaskStatus::Processing]),
            processing_started_at: Some(current),
            ..Default::default()
        };
        let tasks = self.collection.find(&claimed, None).await?;

        debug!("认领 {} 个到期任务", tasks.len());
        metrics::counter!("taskq_tasks_claimed_total", "backend" => "memory")
            .increment(tasks.len() as u64);
        Ok(tasks)
    }

    async fn mark_tasks_as_processing(
        &self,
        tasks: &[Task],
        started_at: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let ids = task_ids(tasks);
        if ids.is_empty() {
            return Ok(0);
        }
        let filter =
            TaskFilter::by_ids(ids).with_statuses(&[TaskStatus::Scheduled, TaskStatus::Processing]);
        let patch = TaskPatch {
            status: Some(TaskStatus::Processing),
            processing_started_at: Some(Some(started_at)),
            ..Default::default()
        };
        self.collection
            .update_many(&filter, &patch, self.clock.now())
            .await
    }

    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> QueueResult<u64> {
        let now = self.clock.now();
        let mut affected = 0;
        for task in tasks {
            let Some(id) = task.id.clone() else {
                continue;
            };
            let filter = TaskFilter::by_ids(vec![id]).with_statuses(&[
                TaskStatus::Scheduled,
                TaskStatus::Processing,
                TaskStatus::Executed,
            ]);
            let patch = TaskPatch {
                status: Some(TaskStatus::Executed),
                execution_result: task.execution_result.clone(),
                ..Default::default()
            };
            affected += self.collection.update_many(&filter, &patch, now).await?;
        }
        Ok(affected)
    }

    async fn mark_tasks_as_failed(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.transition(
            tasks,
            TaskStatus::Failed,
            &[TaskStatus::Scheduled, TaskStatus::Processing],
        )
        .await
    }

    async fn mark_tasks_as_ignored(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.transition(
            tasks,
            TaskStatus::Ignored,
            &[TaskStatus::Scheduled, TaskStatus::Processing],
        )
        .await
    }

    async fn mark_tasks_as_expired(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.transition(
            tasks,
            TaskStatus::Expired,
            &[TaskStatus::Scheduled, TaskStatus::Processing],
        )
        .await
    }

    async fn update_tasks(&self, updates: &[TaskUpdate]) -> QueueResult<Vec<String>> {
        let now = self.clock.now();
        let mut matched = Vec::with_capacity(updates.len());
        for update in updates {
            let filter = TaskFilter::by_ids(vec![update.id.clone()]);
            if self.collection.update_many(&filter, &update.patch, now).await? > 0 {
                matched.push(update.id.clone());
            }
        }
        Ok(matched)
    }

    async fn upsert_tasks(&self, tasks: &[Task]) -> QueueResult<Vec<Task>> {
        let now = self.clock.now();
        let mut written = Vec::with_capacity(tasks.len());

        for task in tasks {
            let mut task = task.clone();
            let id = match &task.id {
                Some(id) => id.clone(),
                None => {
                    let id = self.generate_id();
                    task.id = Some(id.clone());
                    id
                }
            };

            let existing = self
                .collection
                .find(&TaskFilter::by_ids(vec![id]), Some(1))
                .await?;
            if let Some(existing) = existing.first() {
                task.created_at = existing.created_at;
            }
            task.updated_at = now;

            if self.collection.replace_one(task.clone(), true).await? {
                written.push(task);
            } else {
                warn!("任务 {} 与已有任务的 task_hash 冲突，跳过", task.describe());
            }
        }

        Ok(written)
    }

    async fn get_tasks_by_ids(&self, ids: &[String]) -> QueueResult<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.collection
            .find(&TaskFilter::by_ids(ids.to_vec()), None)
            .await
    }

    async fn get_cleanup_stats(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        let (orphaned, expired) = Self::cleanup_filters(orphaned_before, expired_before);
        Ok(CleanupStats {
            orphaned: self.collection.count(&orphaned).await?,
            expired: self.collection.count(&expired).await?,
        })
    }

    async fn cleanup_tasks(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        let (orphaned, expired) = Self::cleanup_filters(orphaned_before, expired_before);
        let stats = CleanupStats {
            orphaned: self.collection.delete_many(&orphaned).await?,
            expired: self.collection.delete_many(&expired).await?,
        };
        if stats.total() > 0 {
            info!(
                "清理任务完成: 孤儿任务 {}, 过期任务 {}",
                stats.orphaned, stats.expired
            );
        }
        Ok(stats)
    }

    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::document::InMemoryTaskCollection;
    use chrono::Duration;
    use serde_json::json;
    use taskq_core::system_clock;

    fn storage() -> DocumentTaskStorage<InMemoryTaskCollection> {
        DocumentTaskStorage::new(InMemoryTaskCollection::new(), system_clock())
    }

    fn task_at(execute_at: DateTime<Utc>) -> Task {
        Task::new("hooks", "webhook", json!({"url": "https://example.com"}), execute_at)
    }

    #[tokio::test]
    async fn test_mature_claim_is_idempotent() {
        let storage = storage();
        let now = Utc::now();
        storage
            .add_tasks_to_scheduled(&[task_at(now - Duration::seconds(1)), task_at(now)])
            .await
            .unwrap();

        let first = storage.get_mature_tasks(now).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = storage.get_mature_tasks(now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_stale_recovery_makes_task_claimable() {
        let storage = storage();
        let now = Utc::now();
        let persisted = storage
            .add_tasks_to_scheduled(&[task_at(now - Duration::hours(60))])
            .await
            .unwrap();
        storage
            .mark_tasks_as_processing(&persisted, now - Duration::hours(49))
            .await
            .unwrap();

        let claimed = storage.get_mature_tasks(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, persisted[0].id);
    }

    #[tokio::test]
    async fn test_processing_within_threshold_is_not_reclaimed() {
        let storage = storage();
        let now = Utc::now();
        let persisted = storage
            .add_tasks_to_scheduled(&[task_at(now - Duration::hours(2))])
            .await
            .unwrap();
        storage
            .mark_tasks_as_processing(&persisted, now - Duration::hours(1))
            .await
            .unwrap();

        assert!(storage.get_mature_tasks(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_marking_is_forward_only() {
        let storage = storage();
        let persisted = storage
            .add_tasks_to_scheduled(&[task_at(Utc::now())])
            .await
            .unwrap();

        assert_eq!(storage.mark_tasks_as_expired(&persisted).await.unwrap(), 1);
        assert_eq!(storage.mark_tasks_as_executed(&persisted).await.unwrap(), 0);

        let stored = storage.get_tasks_by_ids(&task_ids(&persisted)).await.unwrap();
        assert_eq!(stored[0].status, TaskStatus::Expired);
    }

    #[tokio::test]
    async fn test_cleanup_stats_match_deleted() {
        let storage = storage();
        let now = Utc::now();
        let persisted = storage
            .add_tasks_to_scheduled(&[task_at(now), task_at(now)])
            .await
            .unwrap();
        storage.mark_tasks_as_failed(&persisted[..1]).await.unwrap();

        let expired_before = now + Duration::minutes(1);
        let stats = storage
            .get_cleanup_stats(now - Duration::hours(72), expired_before)
            .await
            .unwrap();
        assert_eq!(stats, CleanupStats { orphaned: 0, expired: 1 });

        let removed = storage
            .cleanup_tasks(now - Duration::hours(72), expired_before)
            .await
            .unwrap();
        assert_eq!(removed, stats);
        assert_eq!(storage.collection().len().await, 1);
    }
}
