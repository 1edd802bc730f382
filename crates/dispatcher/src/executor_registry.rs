use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use taskq_core::{
    AsyncTask, ExecutionOutcome, ProcessorOutput, QueueNamespace, QueueResult, Task,
    TaskExecutor, TaskProcessor,
};

/// 执行器及其重试相关的声明
#[derive(Clone)]
pub struct ExecutorDescriptor {
    /// 覆盖默认的最大重试次数
    pub default_retries: Option<u32>,
    /// 未持久化的任务失败时分配id并持久化
    pub store_on_failure: bool,
    /// 成功时保存执行结果
    pub retain_result: bool,
    pub executor: Arc<dyn TaskExecutor>,
}

impl ExecutorDescriptor {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            default_retries: None,
            store_on_failure: false,
            retain_result: false,
            executor,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.default_retries = Some(retries);
        self
    }

    pub fn store_on_failure(mut self) -> Self {
        self.store_on_failure = true;
        self
    }

    pub fn retain_result(mut self) -> Self {
        self.retain_result = true;
        self
    }
}

/// 按 (队列, 任务类型) 索引的执行器注册表
///
/// 注册时队列名会加上命名空间，查询时使用任务上已经带命名空间的 queue_id。
pub struct ExecutorRegistry {
    namespace: QueueNamespace,
    executors: RwLock<HashMap<(String, String), ExecutorDescriptor>>,
}

impl ExecutorRegistry {
    pub fn new(namespace: QueueNamespace) -> Self {
        Self {
            namespace,
            executors: RwLock::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &QueueNamespace {
        &self.namespace
    }

    pub async fn register(
        &self,
        queue_id: &str,
        task_type: impl Into<String>,
        descriptor: ExecutorDescriptor,
    ) {
        let key = (self.namespace.apply(queue_id), task_type.into());
        debug!("注册执行器: {}/{}", key.0, key.1);
        self.executors.write().await.insert(key, descriptor);
    }

    pub async fn unregister(&self, queue_id: &str, task_type: &str) -> bool {
        let key = (self.namespace.apply(queue_id), task_type.to_string());
        self.executors.write().await.remove(&key).is_some()
    }

    pub async fn get(&self, queue_id: &str, task_type: &str) -> Option<ExecutorDescriptor> {
        let registry = self.executors.read().await;
        registry
            .get(&(queue_id.to_string(), task_type.to_string()))
            .cloned()
    }

    pub async fn descriptor_for(&self, task: &Task) -> Option<ExecutorDescriptor> {
        self.get(&task.queue_id, &task.task_type).await
    }

    pub async fn contains(&self, queue_id: &str, task_type: &str) -> bool {
        self.get(queue_id, task_type).await.is_some()
    }

    pub async fn count(&self) -> usize {
        self.executors.read().await.len()
    }

    /// 已注册的 (队列, 任务类型)，已排序
    pub async fn list_executors(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.executors.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// 单个任务经过执行器后的归类
enum Classified {
    Success(Task, Vec<Task>),
    Failed(Task, bool),
    Async(AsyncTask),
    Ignored(Task),
}

/// 通过注册表逐个执行任务的批处理器
pub struct RegistryProcessor {
    registry: Arc<ExecutorRegistry>,
}

impl RegistryProcessor {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self { registry }
    }

    async fn run_one(&self, mut task: Task) -> Classified {
        let Some(descriptor) = self.registry.descriptor_for(&task).await else {
            warn!("任务 {} 没有注册的执行器，忽略", task.describe());
            return Classified::Ignored(task);
        };

        match descriptor.executor.execute(&task).await {
            ExecutionOutcome::Succeeded(result) => {
                if descriptor.retain_result {
                    task.execution_result = result;
                }
                Classified::Success(task, Vec::new())
            }
            ExecutionOutcome::Spawned { result, new_tasks } => {
                if descriptor.retain_result {
                    task.execution_result = result;
                }
                Classified::Success(task, new_tasks)
            }
            ExecutionOutcome::Failed(error) => {
                debug!("任务 {} 执行失败: {}", task.describe(), error);
                task.execution_stats.last_error = Some(error);
                Classified::Failed(task, false)
            }
            ExecutionOutcome::Throttled(error) => {
                warn!("任务 {} 被下游限流: {}", task.describe(), error);
                task.execution_stats.last_error = Some(error);
                Classified::Failed(task, true)
            }
            ExecutionOutcome::InFlight(completion) => {
                Classified::Async(AsyncTask::new(task, completion))
            }
            ExecutionOutcome::Ignored => Classified::Ignored(task),
        }
    }
}

#[async_trait]
impl TaskProcessor for RegistryProcessor {
    async fn process(
        &self,
        consumer_label: &str,
        tasks: Vec<Task>,
    ) -> QueueResult<ProcessorOutput> {
        debug!("[{}] 处理 {} 个任务", consumer_label, tasks.len());
        let results = join_all(tasks.into_iter().map(|task| self.run_one(task))).await;

        let mut output = ProcessorOutput::default();
        for result in results {
            match result {
                Classified::Success(task, new_tasks) => {
                    output.success_tasks.push(task);
                    output.new_tasks.extend(new_tasks);
                }
                Classified::Failed(task, throttled) => {
                    output.throttled |= throttled;
                    output.failed_tasks.push(task);
                }
                Classified::Async(task) => output.async_tasks.push(task),
                Classified::Ignored(task) => output.ignored_tasks.push(task),
            }
        }
        Ok(output)
    }
}
