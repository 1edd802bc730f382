use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::Task;
use crate::QueueResult;

/// 仍在执行中的异步任务，completion 完成时给出执行结果
pub struct AsyncTask {
    pub task: Task,
    pub completion: BoxFuture<'static, QueueResult<Option<serde_json::Value>>>,
}

impl AsyncTask {
    pub fn new(
        task: Task,
        completion: BoxFuture<'static, QueueResult<Option<serde_json::Value>>>,
    ) -> Self {
        Self { task, completion }
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("task", &self.task.describe())
            .finish_non_exhaustive()
    }
}

/// 处理器返回的批次结果
#[derive(Debug, Default)]
pub struct ProcessorOutput {
    pub success_tasks: Vec<Task>,
    pub failed_tasks: Vec<Task>,
    pub new_tasks: Vec<Task>,
    pub async_tasks: Vec<AsyncTask>,
    pub ignored_tasks: Vec<Task>,
    /// 批次中有任务遇到下游限流
    pub throttled: bool,
}

impl ProcessorOutput {
    pub fn total(&self) -> usize {
        self.success_tasks.len()
            + self.failed_tasks.len()
            + self.async_tasks.len()
            + self.ignored_tasks.len()
    }

    /// 出现过的任务类型
    pub fn task_types(&self) -> Vec<String> {
        let mut types = BTreeSet::new();
        for task in self
            .success_tasks
            .iter()
            .chain(self.failed_tasks.iter())
            .chain(self.ignored_tasks.iter())
        {
            types.insert(task.task_type.clone());
        }
        for task in &self.async_tasks {
            types.insert(task.task.task_type.clone());
        }
        types.into_iter().collect()
    }

    pub fn failed_task_types(&self) -> Vec<String> {
        self.failed_tasks
            .iter()
            .map(|t| t.task_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// 后处理输入
#[derive(Debug, Default, Clone)]
pub struct PostProcessInput {
    pub failed_tasks: Vec<Task>,
    pub new_tasks: Vec<Task>,
    pub success_tasks: Vec<Task>,
}

/// 后处理结果统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessReport {
    /// 原地重新调度的持久化任务
    pub rescheduled: usize,
    /// 仅在内存中重新入队的任务
    pub requeued: usize,
    /// 重试耗尽后标记为失败的任务
    pub failed: usize,
    /// 未持久化且重试耗尽而被丢弃的任务
    pub discarded: usize,
    pub executed: usize,
    pub new_tasks: usize,
}

/// 一个批次执行后的汇总，供统计与自适应策略使用
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub async_count: usize,
    pub ignored_count: usize,
    pub deferred_count: usize,
    pub task_types: Vec<String>,
    pub failed_task_types: Vec<String>,
    /// 处理器报告了下游限流
    pub throttled: bool,
    pub post_process: PostProcessReport,
}

/// 反馈给 AIMD 控制器的批次结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// 分片 id 只在所属流内唯一
    #[serde(default)]
    pub stream_id: String,
    pub shard_id: String,
    pub record_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub task_types: Vec<String>,
    pub failed_task_types: Vec<String>,
    pub throttled: bool,
    pub poison_pill: bool,
}

impl BatchResult {
    /// 失败、限流与毒丸统一视为失败信号
    pub fn is_failure(&self) -> bool {
        self.failure_count > 0 || self.throttled || self.poison_pill
    }
}

/// 分片流中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub sequence_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub data: Vec<u8>,
    pub arrived_at: DateTime<Utc>,
}

/// 一次拉取的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub records: Vec<StreamRecord>,
    /// 分片已被关闭（例如分裂或合并），不会再有新记录
    pub shard_closed: bool,
}
