use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use taskq_core::{AsyncTask, AsyncTaskManager, QueueResult, Task};

/// 异步任务的完成通知
#[derive(Debug)]
pub struct AsyncCompletion {
    pub task: Task,
    pub result: QueueResult<Option<serde_json::Value>>,
}

/// 容量有限的异步任务管理器
///
/// 每个提交的任务占用一个许可，完成后把结果发送到完成通道，由任务处理器
/// 进行后处理。许可耗尽时 try_submit 原样返回任务。
pub struct BoundedAsyncTaskManager {
    permits: Arc<Semaphore>,
    capacity: usize,
    completions: mpsc::UnboundedSender<AsyncCompletion>,
}

impl BoundedAsyncTaskManager {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<AsyncCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            completions: tx,
        };
        (manager, rx)
    }
}

impl AsyncTaskManager for BoundedAsyncTaskManager {
    fn try_submit(&self, task: AsyncTask) -> Result<(), AsyncTask> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(task),
        };

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let AsyncTask { task, completion } = task;
            let result = completion.await;
            drop(permit);
            if completions.send(AsyncCompletion { task, result }).is_err() {
                debug!("完成通道已关闭，丢弃异步任务结果");
            }
        });
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
