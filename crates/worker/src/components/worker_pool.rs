use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use taskq_core::{QueueError, QueueResult};

/// 限制同时执行的处理器批次数
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// 等待一个空闲槽位，许可在释放前一直占用该槽位
    pub async fn acquire(&self) -> QueueResult<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Internal("工作池已关闭".to_string()))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// 关闭后新的 acquire 立即失败
    pub fn close(&self) {
        self.permits.close();
    }
}
