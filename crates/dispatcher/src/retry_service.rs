use chrono::{DateTime, Utc};
use tracing::debug;

use taskq_core::{ExecutionStats, Task, TaskPatch, TaskStatus, TaskUpdate};

use crate::executor_registry::ExecutorDescriptor;

/// 失败任务的重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 执行器未声明时的最大重试次数
    pub default_max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
        }
    }
}

/// 对一个失败任务的处理决定
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 已持久化且仍有重试预算，原地重新调度
    Reschedule(TaskUpdate),
    /// 已持久化且重试耗尽
    Fail,
    /// 未持久化但执行器要求持久化，任务已获得新id
    Persist(Task),
    /// 仅在内存中重新入队
    Requeue(Task),
    /// 未持久化且重试耗尽
    Discard,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 执行器声明优先，否则使用默认值
    pub fn max_retries(&self, descriptor: Option<&ExecutorDescriptor>) -> u32 {
        descriptor
            .and_then(|d| d.default_retries)
            .unwrap_or(self.config.default_max_retries)
    }

    /// 计算下一次尝试：execute_at = now + retry_after * (retry_count + 1)^2
    pub fn next_attempt(&self, task: &Task, now: DateTime<Utc>) -> TaskPatch {
        let retry_count = task.retry_count().saturating_add(1);
        TaskPatch {
            status: Some(TaskStatus::Scheduled),
            execute_at: Some(task.next_retry_at(now)),
            retries: Some(retry_count),
            execution_stats: Some(ExecutionStats {
                retry_count,
                last_error: task.execution_stats.last_error.clone(),
                last_attempt_at: Some(now),
            }),
            processing_started_at: Some(None),
            ..Default::default()
        }
    }

    /// 决定失败任务的去向
    ///
    /// mint_id 仅在任务没有id且执行器要求 store_on_failure 时调用。
    pub fn decide(
        &self,
        task: &Task,
        descriptor: Option<&ExecutorDescriptor>,
        now: DateTime<Utc>,
        mint_id: impl FnOnce() -> String,
    ) -> RetryDecision {
        let max_retries = self.max_retries(descriptor);
        let has_budget = task.retry_count() < max_retries;
        let store_on_failure = descriptor.is_some_and(|d| d.store_on_failure);

        debug!(
            "任务 {} 失败，已重试 {}/{} 次",
            task.describe(),
            task.retry_count(),
            max_retries
        );

        match (&task.id, has_budget) {
            (Some(id), true) => RetryDecision::Reschedule(TaskUpdate {
                id: id.clone(),
                patch: self.next_attempt(task, now),
            }),
            (Some(_), false) => RetryDecision::Fail,
            (None, _) if store_on_failure => {
                let mut stored = task.clone();
                stored.id = Some(mint_id());
                if has_budget {
                    self.next_attempt(task, now).apply_to(&mut stored, now);
                } else {
                    stored.status = TaskStatus::Failed;
                    stored.processing_started_at = None;
                    stored.updated_at = now;
                }
                RetryDecision::Persist(stored)
            }
            (None, true) => {
                let mut retry = task.clone();
                self.next_attempt(task, now).apply_to(&mut retry, now);
                RetryDecision::Requeue(retry)
            }
            (None, false) => RetryDecision::Discard,
        }
    }
}
