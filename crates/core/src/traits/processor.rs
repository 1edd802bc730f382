use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::models::{AsyncTask, ProcessorOutput, Task};
use crate::QueueResult;

/// 批处理器：执行一批任务并按结果分类
///
/// 单个任务的业务错误应放入 failed_tasks；只有整批无法处理（如下游限流）
/// 时才返回错误。
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, consumer_label: &str, tasks: Vec<Task>)
        -> QueueResult<ProcessorOutput>;
}

/// 单个任务类型的执行器
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> ExecutionOutcome;
}

/// 执行器对单个任务的执行结果
pub enum ExecutionOutcome {
    Succeeded(Option<serde_json::Value>),
    /// 成功并派生出新的任务
    Spawned {
        result: Option<serde_json::Value>,
        new_tasks: Vec<Task>,
    },
    Failed(String),
    /// 下游限流，任务按失败处理并向自适应策略报告限流
    Throttled(String),
    /// 结果稍后由 future 给出
    InFlight(BoxFuture<'static, QueueResult<Option<serde_json::Value>>>),
    Ignored,
}

/// 异步任务管理器，容量有限
pub trait AsyncTaskManager: Send + Sync {
    /// 提交异步任务；队列已满时原样返回
    fn try_submit(&self, task: AsyncTask) -> Result<(), AsyncTask>;

    fn in_flight(&self) -> usize;

    fn capacity(&self) -> usize;
}
