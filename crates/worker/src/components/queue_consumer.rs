use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskq_core::config::ConsumerConfig;
use taskq_core::{ActiveQueue, QueueResult};
use taskq_dispatcher::TaskHandler;

use super::worker_pool::WorkerPool;

/// 活跃队列的轮询消费者
///
/// 每轮先获取 `queue:{queue}:{instance}` 锁再出队，锁名包含实例id，
/// 因此它只防止同一实例内的重复轮询。
pub struct QueueConsumer {
    queue_id: String,
    lock_name: String,
    label: String,
    handler: Arc<TaskHandler>,
    active: Arc<dyn ActiveQueue>,
    pool: WorkerPool,
    config: ConsumerConfig,
}

impl QueueConsumer {
    pub fn new(
        queue_id: impl Into<String>,
        handler: Arc<TaskHandler>,
        active: Arc<dyn ActiveQueue>,
        pool: WorkerPool,
        config: ConsumerConfig,
    ) -> Self {
        let queue_id = queue_id.into();
        let instance = handler.locks().owner().to_string();
        Self {
            lock_name: format!("queue:{queue_id}:{instance}"),
            label: format!("queue:{queue_id}"),
            queue_id,
            handler,
            active,
            pool,
            config,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// 取出一批到期任务并执行，返回处理的任务数
    pub async fn poll_once(&self) -> QueueResult<usize> {
        let locks = self.handler.locks();
        if !locks
            .acquire(&self.lock_name, self.config.queue_lock_ttl())
            .await?
        {
            debug!("队列 {} 正在被轮询，跳过", self.queue_id);
            return Ok(0);
        }

        let result = self.drain_batch().await;

        if let Err(e) = locks.release(&self.lock_name).await {
            warn!("释放队列锁 {} 失败: {}", self.lock_name, e);
        }
        result
    }

    async fn drain_batch(&self) -> QueueResult<usize> {
        let now = self.handler.clock().now();
        let tasks = self
            .active
            .dequeue_batch(&self.queue_id, self.config.batch_size, now)
            .await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let count = tasks.len();
        let _permit = match self.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                self.active.enqueue(&self.queue_id, tasks).await?;
                return Err(e);
            }
        };
        let retained = tasks.clone();

        match self
            .handler
            .execute_batch(self.active.as_ref(), &self.label, &self.queue_id, tasks)
            .await
        {
            Ok(report) => {
                debug!(
                    "队列 {} 本批处理 {} 个任务，成功 {}，失败 {}",
                    self.queue_id, count, report.success_count, report.failure_count
                );
                Ok(count)
            }
            Err(e) if e.is_throttled() => {
                warn!("队列 {} 被限流，{} 个任务放回队列", self.queue_id, count);
                self.active.enqueue(&self.queue_id, retained).await?;
                Ok(0)
            }
            // 基础设施故障时整批放回，下一轮再处理
            Err(e) if e.is_retryable() => {
                warn!(
                    "队列 {} 执行批次失败，{} 个任务放回队列: {}",
                    self.queue_id, count, e
                );
                self.active.enqueue(&self.queue_id, retained).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "队列 {} 的消费者已启动，轮询间隔 {:?}",
                self.queue_id,
                self.config.poll_interval()
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            error!("队列 {} 消费失败: {}", self.queue_id, e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("收到关闭信号，停止队列 {} 的消费者", self.queue_id);
                        break;
                    }
                }
            }
        })
    }
}
