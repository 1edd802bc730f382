//! 文档集合抽象
//!
//! 只暴露任务存储需要的少量文档操作（查找、批量更新、替换、删除、计数），
//! 具体的文档数据库驱动实现该接口即可复用 [`super::DocumentTaskStorage`]。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskq_core::{QueueResult, Task, TaskPatch, TaskStatus};
use tokio::sync::RwLock;

/// 文档查询条件，多个条件之间为 AND 关系
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub ids: Option<Vec<String>>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub execute_at_lte: Option<DateTime<Utc>>,
    pub processing_started_before: Option<DateTime<Utc>>,
    /// processing_started_at 恰好等于该值
    pub processing_started_at: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn by_ids(ids: Vec<String>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[TaskStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ids) = &self.ids {
            match &task.id {
                Some(id) if ids.contains(id) => {}
                _ => return false,
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(limit) = self.execute_at_lte {
            if task.execute_at > limit {
                return false;
            }
        }
        if let Some(before) = self.processing_started_before {
            if !task.processing_started_at.is_some_and(|started| started < before) {
                return false;
            }
        }
        if let Some(exact) = self.processing_started_at {
            if task.processing_started_at != Some(exact) {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if task.updated_at >= before {
                return false;
            }
        }
        true
    }
}

/// 任务文档集合
#[async_trait]
pub trait TaskCollection: Send + Sync {
    /// 插入文档；id 或仍在执行中的 task_hash 冲突时返回 false
    async fn insert_one(&self, task: Task) -> QueueResult<bool>;

    /// 按 execute_at 升序返回匹配的文档
    async fn find(&self, filter: &TaskFilter, limit: Option<usize>) -> QueueResult<Vec<Task>>;

    async fn update_many(
        &self,
        filter: &TaskFilter,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> QueueResult<u64>;

    /// 按id整体替换，upsert 为 true 时不存在则插入
    async fn replace_one(&self, task: Task, upsert: bool) -> QueueResult<bool>;

    async fn delete_many(&self, filter: &TaskFilter) -> QueueResult<u64>;

    async fn count(&self, filter: &TaskFilter) -> QueueResult<u64>;
}

fn is_live(task: &Task) -> bool {
    matches!(task.status, TaskStatus::Scheduled | TaskStatus::Processing)
}

/// 内存文档集合，用于嵌入式部署与测试
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskCollection {
    documents: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    fn hash_taken(documents: &HashMap<String, Task>, task: &Task) -> bool {
        let Some(hash) = &task.task_hash else {
            return false;
        };
        documents.values().any(|existing| {
            existing.id != task.id
                && is_live(existing)
                && existing.queue_id == task.queue_id
                && existing.task_hash.as_ref() == Some(hash)
        })
    }
}

#[async_trait]
impl TaskCollection for InMemoryTaskCollection {
    async fn insert_one(&self, task: Task) -> QueueResult<bool> {
        let Some(id) = task.id.clone() else {
            return Ok(false);
        };
        let mut documents = self.documents.write().await;
        if documents.contains_key(&id) || (is_live(&task) && Self::hash_taken(&documents, &task)) {
            return Ok(false);
        }
        documents.insert(id, task);
        Ok(true)
    }

    async fn find(&self, filter: &TaskFilter, limit: Option<usize>) -> QueueResult<Vec<Task>> {
        let documents = self.documents.read().await;
        let mut found: Vec<Task> = documents
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.execute_at.cmp(&b.execute_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn update_many(
        &self,
        filter: &TaskFilter,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let mut documents = self.documents.write().await;
        let mut updated = 0;
        for task in documents.values_mut().filter(|task| filter.matches(task)) {
            patch.apply_to(task, now);
            updated += 1;
        }
        Ok(updated)
    }

    async fn replace_one(&self, task: Task, upsert: bool) -> QueueResult<bool> {
        let Some(id) = task.id.clone() else {
            return Ok(false);
        };
        let mut documents = self.documents.write().await;
        if !upsert && !documents.contains_key(&id) {
            return Ok(false);
        }
        if is_live(&task) && Self::hash_taken(&documents, &task) {
            return Ok(false);
        }
        documents.insert(id, task);
        Ok(true)
    }

    async fn delete_many(&self, filter: &TaskFilter) -> QueueResult<u64> {
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|_, task| !filter.matches(task));
        Ok((before - documents.len()) as u64)
    }

    async fn count(&self, filter: &TaskFilter) -> QueueResult<u64> {
        let documents = self.documents.read().await;
        Ok(documents.values().filter(|task| filter.matches(task)).count() as u64)
    }
}
