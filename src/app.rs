use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskq_core::config::AppConfig;
use taskq_core::{
    system_clock, ActiveQueue, CacheProvider, Clock, ExecutionOutcome, PartitionedStream,
    StorageAdapter, Task, TaskExecutor,
};
use taskq_dispatcher::{
    AsyncCompletion, BoundedAsyncTaskManager, ExecutorDescriptor, ExecutorRegistry,
    RegistryProcessor, TaskHandler,
};
use taskq_infrastructure::{
    CacheFactory, CacheShardLeaser, InMemoryActiveQueue, LockManager, StorageFactory,
};
use taskq_worker::{
    AdaptiveStrategy, ConsumerContext, NoopLifecycleHook, QueueConsumer, ShardLifecycleHook,
    ShardRebalancer, WorkerPool,
};

use crate::shutdown::ShutdownManager;

/// 内置执行器处理的任务类型
pub const LOG_TASK_TYPE: &str = "log";

/// 只记录任务内容的执行器，注册在每个启用的队列上
struct LoggingExecutor;

#[async_trait]
impl TaskExecutor for LoggingExecutor {
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        info!("执行日志任务 {}: {}", task.describe(), task.payload);
        ExecutionOutcome::Succeeded(None)
    }
}

/// 主应用程序，负责组装各个组件
pub struct Application {
    config: AppConfig,
    instance_id: String,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn StorageAdapter>,
    cache: Arc<dyn CacheProvider>,
    registry: Arc<ExecutorRegistry>,
    handler: Arc<TaskHandler>,
    active: Arc<dyn ActiveQueue>,
    pool: WorkerPool,
    completions: Option<mpsc::UnboundedReceiver<AsyncCompletion>>,
    stream: Option<Arc<dyn PartitionedStream>>,
    hook: Arc<dyn ShardLifecycleHook>,
}

impl Application {
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        Self::from_config_with_clock(config, system_clock()).await
    }

    pub async fn from_config_with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let instance_id = config.instance.resolve_id();
        info!("初始化应用程序，实例: {}", instance_id);

        let storage = StorageFactory::create(&config.storage, clock.clone())
            .await
            .context("创建任务存储失败")?;
        let cache = CacheFactory::create(&config.cache)
            .await
            .context("创建缓存失败")?;
        let locks = LockManager::new(cache.clone(), instance_id.clone());

        let registry = Arc::new(ExecutorRegistry::new(config.instance.namespace()));
        let logging: Arc<dyn TaskExecutor> = Arc::new(LoggingExecutor);
        for queue in &config.instance.enabled_queues {
            registry
                .register(queue, LOG_TASK_TYPE, ExecutorDescriptor::new(logging.clone()))
                .await;
        }
        let processor = Arc::new(RegistryProcessor::new(registry.clone()));

        let (async_manager, completions) =
            BoundedAsyncTaskManager::new(config.handler.async_capacity);
        let handler = Arc::new(
            TaskHandler::new(
                storage.clone(),
                locks,
                registry.clone(),
                processor,
                clock.clone(),
                config.handler.clone(),
            )
            .with_async_manager(Arc::new(async_manager)),
        );

        Ok(Self {
            pool: WorkerPool::new(config.consumer.worker_pool_size),
            config,
            instance_id,
            clock,
            storage,
            cache,
            registry,
            handler,
            active: Arc::new(InMemoryActiveQueue::new()),
            completions: Some(completions),
            stream: None,
            hook: Arc::new(NoopLifecycleHook),
        })
    }

    /// 分区流客户端，启用分片再均衡时必须提供
    pub fn with_stream(mut self, stream: Arc<dyn PartitionedStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_lifecycle_hook(mut self, hook: Arc<dyn ShardLifecycleHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &Arc<TaskHandler> {
        &self.handler
    }

    pub fn active_queue(&self) -> &Arc<dyn ActiveQueue> {
        &self.active
    }

    /// 启动所有后台循环
    pub fn start(&mut self, shutdown: &ShutdownManager) -> Result<RunningApplication> {
        if self.config.rebalancer.enabled && self.stream.is_none() {
            return Err(anyhow::anyhow!("启用分片再均衡时必须提供分区流客户端"));
        }

        let mut handles = self.handler.start(
            self.active.clone(),
            self.completions.take(),
            shutdown.subscribe(),
        );

        for queue in self.config.instance.namespaced_queues() {
            let consumer = Arc::new(QueueConsumer::new(
                queue,
                self.handler.clone(),
                self.active.clone(),
                self.pool.clone(),
                self.config.consumer.clone(),
            ));
            handles.push(consumer.start(shutdown.subscribe()));
        }

        let stream = self.stream.clone().filter(|_| self.config.rebalancer.enabled);
        let rebalancer = if let Some(stream) = stream {
            let rebalancer = Arc::new(self.build_rebalancer(stream, shutdown));
            handles.extend(rebalancer.start());
            Some(rebalancer)
        } else {
            None
        };

        info!(
            "应用程序已启动: {} 个队列消费者，分片再均衡{}",
            self.config.instance.enabled_queues.len(),
            if rebalancer.is_some() { "已启用" } else { "未启用" }
        );
        Ok(RunningApplication {
            handles,
            rebalancer,
            handler: self.handler.clone(),
        })
    }

    fn build_rebalancer(
        &self,
        stream: Arc<dyn PartitionedStream>,
        shutdown: &ShutdownManager,
    ) -> ShardRebalancer {
        let config = self.config.rebalancer.clone();
        let leaser = Arc::new(CacheShardLeaser::new(
            self.cache.clone(),
            self.instance_id.clone(),
            config.heartbeat_ttl(),
            config.lease_ttl(),
        ));
        let ctx = Arc::new(ConsumerContext {
            stream,
            leaser,
            cache: self.cache.clone(),
            strategy: Arc::new(AdaptiveStrategy::new(
                self.config.adaptive.clone(),
                self.clock.clone(),
            )),
            handler: self.handler.clone(),
            active: self.active.clone(),
            pool: self.pool.clone(),
            hook: self.hook.clone(),
            config,
        });
        ShardRebalancer::new(ctx, shutdown.subscribe())
    }

    /// 运行直到收到关闭信号
    pub async fn run(mut self, shutdown: ShutdownManager) -> Result<()> {
        let running = self.start(&shutdown)?;
        shutdown.wait_for_shutdown().await;
        running.stop(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// 已启动的应用
pub struct RunningApplication {
    handles: Vec<JoinHandle<()>>,
    rebalancer: Option<Arc<ShardRebalancer>>,
    handler: Arc<TaskHandler>,
}

impl RunningApplication {
    pub fn rebalancer(&self) -> Option<&Arc<ShardRebalancer>> {
        self.rebalancer.as_ref()
    }

    /// 关闭信号发出后调用：交出分片、等待后台循环退出并上报统计
    pub async fn stop(self, timeout: Duration) {
        if let Some(rebalancer) = &self.rebalancer {
            rebalancer.shutdown().await;
        }

        let joined = tokio::time::timeout(timeout, futures::future::join_all(self.handles)).await;
        if joined.is_err() {
            warn!("等待后台任务退出超时");
        }

        self.handler.flush_stats();
        info!("应用程序已停止");
    }
}
