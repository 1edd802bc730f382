//! 单个分片的消费者
//!
//! 状态机：Idle -> Consuming -> {Lost, Stopped}。消费期间每轮都检查并续期
//! 分片租约；租约丢失时触发一次 on_shard_lost 并退出。任何退出路径都只
//! 执行一次清理（移除自己的注册项、释放租约、触发回调）。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskq_core::config::RebalancerConfig;
use taskq_core::{
    ActiveQueue, BatchResult, CacheProvider, PartitionedStream, ShardLeaser,
    StreamRecord, Task,
};
use taskq_dispatcher::TaskHandler;

use super::lifecycle_hook::{fire_hook, HookEvent, ShardLifecycleHook};
use super::worker_pool::WorkerPool;
use crate::adaptive::AdaptiveStrategy;

/// 检查点键前缀
pub const CHECKPOINT_PREFIX: &str = "shard-checkpoint:";

pub fn checkpoint_key(stream_id: &str, shard_id: &str) -> String {
    format!("{CHECKPOINT_PREFIX}{stream_id}:{shard_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    /// 租约被夺走
    Lost,
    Stopped,
}

/// 所有分片消费者共享的依赖
pub struct ConsumerContext {
    pub stream: Arc<dyn PartitionedStream>,
    pub leaser: Arc<dyn ShardLeaser>,
    pub cache: Arc<dyn CacheProvider>,
    pub strategy: Arc<AdaptiveStrategy>,
    pub handler: Arc<TaskHandler>,
    pub active: Arc<dyn ActiveQueue>,
    pub pool: WorkerPool,
    pub hook: Arc<dyn ShardLifecycleHook>,
    pub config: RebalancerConfig,
}

/// 正在运行的消费者的控制句柄
pub struct ShardConsumerHandle {
    stream_id: String,
    shard_id: String,
    generation: u64,
    state: Arc<Mutex<ConsumerState>>,
    stop_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ShardConsumerHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), ConsumerState::Idle | ConsumerState::Consuming)
    }

    /// 请求停止，可重复调用
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// 请求停止并等待在途批次完成，超时后放弃等待
    pub async fn stop_and_wait(&self, timeout: Duration) {
        self.stop();
        let join = self
            .join
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(join) = join {
            if tokio::time::timeout(timeout, join).await.is_err() {
                warn!(
                    "等待分片消费者 {}/{} 停止超时",
                    self.stream_id, self.shard_id
                );
            }
        }
    }
}

/// 按 (stream, shard) 跟踪本实例的消费者
#[derive(Clone, Default)]
pub struct ShardRegistry {
    consumers: Arc<Mutex<HashMap<(String, String), Arc<ShardConsumerHandle>>>>,
    generations: Arc<AtomicU64>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Arc<ShardConsumerHandle>>> {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, stream_id: &str, shard_id: &str) -> Option<Arc<ShardConsumerHandle>> {
        self.lock()
            .get(&(stream_id.to_string(), shard_id.to_string()))
            .cloned()
    }

    /// 插入新的句柄，返回被替换的旧句柄
    fn insert(&self, handle: Arc<ShardConsumerHandle>) -> Option<Arc<ShardConsumerHandle>> {
        let key = (handle.stream_id.clone(), handle.shard_id.clone());
        self.lock().insert(key, handle)
    }

    /// 仅当注册项仍属于该代时移除
    fn remove_if_generation(&self, stream_id: &str, shard_id: &str, generation: u64) -> bool {
        let mut consumers = self.lock();
        let key = (stream_id.to_string(), shard_id.to_string());
        if consumers.get(&key).is_some_and(|h| h.generation == generation) {
            consumers.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn remove(&self, stream_id: &str, shard_id: &str) -> Option<Arc<ShardConsumerHandle>> {
        self.lock()
            .remove(&(stream_id.to_string(), shard_id.to_string()))
    }

    /// 仍在运行的消费者所在的分片
    pub fn active_shards(&self, stream_id: &str) -> BTreeSet<String> {
        self.lock()
            .iter()
            .filter(|((stream, _), handle)| stream == stream_id && handle.is_active())
            .map(|((_, shard), _)| shard.clone())
            .collect()
    }

    pub fn drain_stream(&self, stream_id: &str) -> Vec<Arc<ShardConsumerHandle>> {
        let mut consumers = self.lock();
        let keys: Vec<_> = consumers
            .keys()
            .filter(|(stream, _)| stream == stream_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| consumers.remove(&key))
            .collect()
    }

    pub fn drain_all(&self) -> Vec<Arc<ShardConsumerHandle>> {
        self.lock().drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 消费循环的退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    StopRequested,
    LeaseLost,
    ShardClosed,
    FetchFailed,
    Panicked,
}

/// 一批记录处理后的结果
struct ProcessedBatch {
    result: BatchResult,
    /// 是否可以推进检查点
    advance: bool,
}

pub struct ShardConsumer {
    ctx: Arc<ConsumerContext>,
    registry: ShardRegistry,
    stream_id: String,
    shard_id: String,
    generation: u64,
    label: String,
    state: Arc<Mutex<ConsumerState>>,
    stop_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    cleaned_up: AtomicBool,
}

impl ShardConsumer {
    /// 启动消费者并注册，调用方必须已经持有分片租约
    ///
    /// 同一分片的旧注册项会被替换并停止。
    pub fn spawn(
        ctx: Arc<ConsumerContext>,
        registry: ShardRegistry,
        stream_id: &str,
        shard_id: &str,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<ShardConsumerHandle> {
        let generation = registry.next_generation();
        let state = Arc::new(Mutex::new(ConsumerState::Idle));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = Arc::new(ShardConsumerHandle {
            stream_id: stream_id.to_string(),
            shard_id: shard_id.to_string(),
            generation,
            state: state.clone(),
            stop_tx,
            join: Mutex::new(None),
        });
        if let Some(stale) = registry.insert(handle.clone()) {
            debug!(
                "替换分片 {}/{} 的旧消费者 (generation {})",
                stream_id, shard_id, stale.generation
            );
            stale.stop();
        }

        let consumer = ShardConsumer {
            ctx,
            registry,
            stream_id: stream_id.to_string(),
            shard_id: shard_id.to_string(),
            generation,
            label: format!("shard:{stream_id}:{shard_id}"),
            state,
            stop_rx,
            shutdown_rx,
            cleaned_up: AtomicBool::new(false),
        };
        let join = tokio::spawn(consumer.run());
        *handle.join.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
        handle
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// 停止信号、全局关闭或控制句柄被丢弃都视为停止
    fn is_running(&self) -> bool {
        let stopped = *self.stop_rx.borrow() || self.stop_rx.has_changed().is_err();
        let shutting_down = *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err();
        !stopped && !shutting_down
    }

    fn processing_delay(&self) -> Duration {
        self.ctx
            .strategy
            .get_processing_delay(&self.stream_id, &self.shard_id)
    }

    /// 可被停止信号打断的等待，返回是否应继续运行
    async fn pause(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_running();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop_rx.changed() => {}
            _ = self.shutdown_rx.changed() => {}
        }
        self.is_running()
    }

    async fn run(mut self) {
        self.set_state(ConsumerState::Consuming);
        info!("开始消费分片 {}/{}", self.stream_id, self.shard_id);
        fire_hook(
            self.ctx.hook.as_ref(),
            HookEvent::Acquired,
            &self.stream_id,
            &self.shard_id,
        )
        .await;

        // 处理器 panic 也要走清理，否则注册项会一直停留在 Consuming
        let reason = match AssertUnwindSafe(self.consume()).catch_unwind().await {
            Ok(reason) => reason,
            Err(_) => {
                error!("分片 {} 消费循环 panic", self.label);
                ExitReason::Panicked
            }
        };
        self.cleanup(reason).await;
    }

    async fn consume(&mut self) -> ExitReason {
        let mut checkpoint = self.load_checkpoint().await;
        let mut fetch_errors = 0u32;

        loop {
            if !self.is_running() {
                return ExitReason::StopRequested;
            }

            match self
                .ctx
                .leaser
                .is_lock_held(&self.stream_id, &self.shard_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => return ExitReason::LeaseLost,
                Err(e) => {
                    warn!("检查分片 {} 租约失败: {}", self.label, e);
                    if !self.pause(self.ctx.config.backoff_poll()).await {
                        return ExitReason::StopRequested;
                    }
                    continue;
                }
            }

            if let Some(remaining) = self
                .ctx
                .strategy
                .backoff_remaining(&self.stream_id, &self.shard_id)
            {
                let wait = remaining.min(self.ctx.config.backoff_poll());
                if !self.pause(wait).await {
                    return ExitReason::StopRequested;
                }
                continue;
            }

            let limit = self.ctx.strategy.get_batch_size(&self.stream_id, &self.shard_id);
            let fetched = self
                .ctx
                .stream
                .get_records(&self.stream_id, &self.shard_id, checkpoint.as_deref(), limit)
                .await;

            let batch = match fetched {
                Ok(batch) => {
                    fetch_errors = 0;
                    batch
                }
                Err(e) if !e.is_retryable() => {
                    error!("分片 {} 拉取失败且不可恢复: {}", self.label, e);
                    return ExitReason::FetchFailed;
                }
                Err(e) => {
                    fetch_errors += 1;
                    warn!(
                        "分片 {} 拉取失败 ({}/{}): {}",
                        self.label, fetch_errors, self.ctx.config.max_fetch_errors, e
                    );
                    if fetch_errors >= self.ctx.config.max_fetch_errors {
                        return ExitReason::FetchFailed;
                    }
                    let delay = self.processing_delay();
                    if !self.pause(delay).await {
                        return ExitReason::StopRequested;
                    }
                    continue;
                }
            };

            if batch.records.is_empty() {
                if batch.shard_closed {
                    info!("分片 {} 已关闭且消费完毕", self.label);
                    return ExitReason::ShardClosed;
                }
                if !self.pause(self.ctx.config.idle_poll()).await {
                    return ExitReason::StopRequested;
                }
                continue;
            }

            let last_sequence = batch
                .records
                .last()
                .map(|r| r.sequence_number.clone());
            let processed = self.process_records(batch.records).await;
            self.ctx.strategy.record_batch_result(&processed.result);

            if processed.advance {
                if let Some(sequence) = last_sequence {
                    self.save_checkpoint(&sequence).await;
                    checkpoint = Some(sequence);
                }
            }

            let delay = self.processing_delay();
            if !self.pause(delay).await {
                return ExitReason::StopRequested;
            }
        }
    }

    async fn process_records(&self, records: Vec<StreamRecord>) -> ProcessedBatch {
        let hot_types: HashSet<String> = self
            .ctx
            .strategy
            .hot_task_types(&self.stream_id, &self.shard_id)
            .into_iter()
            .collect();

        let mut result = BatchResult {
            stream_id: self.stream_id.clone(),
            shard_id: self.shard_id.clone(),
            record_count: records.len(),
            ..Default::default()
        };
        let (tasks, undecodable) = decode_records(&records);
        if undecodable > 0 {
            warn!("分片 {} 有 {} 条记录无法解析，跳过", self.label, undecodable);
            result.poison_pill = true;
            result.failure_count += undecodable;
        }

        let _permit = match self.ctx.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("分片 {} 无法获取工作槽位: {}", self.label, e);
                return ProcessedBatch {
                    result,
                    advance: false,
                };
            }
        };

        let mut advance = true;
        let mut task_types = BTreeSet::new();
        let mut failed_types = BTreeSet::new();

        for (queue_id, group) in group_by_queue(tasks) {
            let group_len = group.len();
            match self
                .ctx
                .handler
                .execute_batch(self.ctx.active.as_ref(), &self.label, &queue_id, group)
                .await
            {
                Ok(report) => {
                    result.success_count += report.success_count + report.async_count;
                    result.failure_count += report.failure_count;
                    result.throttled |= report.throttled;
                    task_types.extend(report.task_types);
                    failed_types.extend(report.failed_task_types);
                }
                Err(e) if e.is_throttled() => {
                    warn!("分片 {} 被限流，从同一检查点重试: {}", self.label, e);
                    result.throttled = true;
                    advance = false;
                    break;
                }
                Err(e) => {
                    error!("分片 {} 执行批次失败: {}", self.label, e);
                    result.failure_count += group_len;
                    if e.is_retryable() {
                        advance = false;
                        break;
                    }
                }
            }
        }

        if failed_types.iter().any(|t| hot_types.contains(t)) {
            warn!("分片 {} 的热点任务类型再次失败，视为毒丸", self.label);
            result.poison_pill = true;
        }
        result.task_types = task_types.into_iter().collect();
        result.failed_task_types = failed_types.into_iter().collect();

        ProcessedBatch { result, advance }
    }

    async fn load_checkpoint(&self) -> Option<String> {
        let key = checkpoint_key(&self.stream_id, &self.shard_id);
        match self.ctx.cache.get(&key).await {
            Ok(checkpoint) => {
                if let Some(sequence) = &checkpoint {
                    info!("分片 {} 从检查点 {} 继续消费", self.label, sequence);
                }
                checkpoint
            }
            Err(e) => {
                warn!("读取分片 {} 检查点失败，从头消费: {}", self.label, e);
                None
            }
        }
    }

    async fn save_checkpoint(&self, sequence: &str) {
        let key = checkpoint_key(&self.stream_id, &self.shard_id);
        if let Err(e) = self.ctx.cache.set(&key, sequence, None).await {
            warn!("保存分片 {} 检查点失败: {}", self.label, e);
        }
    }

    /// 退出清理，只执行一次
    async fn cleanup(&self, reason: ExitReason) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        let removed =
            self.registry
                .remove_if_generation(&self.stream_id, &self.shard_id, self.generation);
        debug!(
            "分片 {} 消费者退出: {:?} (移除注册项: {})",
            self.label, reason, removed
        );

        match reason {
            ExitReason::LeaseLost => {
                self.set_state(ConsumerState::Lost);
                warn!("分片 {} 的租约已丢失", self.label);
                fire_hook(
                    self.ctx.hook.as_ref(),
                    HookEvent::Lost,
                    &self.stream_id,
                    &self.shard_id,
                )
                .await;
            }
            _ => {
                self.set_state(ConsumerState::Stopped);
                if let Err(e) = self
                    .ctx
                    .leaser
                    .release_lock(&self.stream_id, &self.shard_id)
                    .await
                {
                    warn!("释放分片 {} 租约失败: {}", self.label, e);
                }
                fire_hook(
                    self.ctx.hook.as_ref(),
                    HookEvent::Released,
                    &self.stream_id,
                    &self.shard_id,
                )
                .await;
            }
        }
        // 已被新一代消费者接管时保留其策略状态
        if removed || self.registry.get(&self.stream_id, &self.shard_id).is_none() {
            self.ctx.strategy.remove_shard(&self.stream_id, &self.shard_id);
        }
        info!("分片 {} 消费者已停止", self.label);
    }
}

fn decode_records(records: &[StreamRecord]) -> (Vec<Task>, usize) {
    let mut tasks = Vec::with_capacity(records.len());
    let mut undecodable = 0;
    for record in records {
        match serde_json::from_slice::<Task>(&record.data) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                debug!("记录 {} 解析失败: {}", record.sequence_number, e);
                undecodable += 1;
            }
        }
    }
    (tasks, undecodable)
}

fn group_by_queue(tasks: Vec<Task>) -> BTreeMap<String, Vec<Task>> {
    let mut groups: BTreeMap<String, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.queue_id.clone()).or_default().push(task);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_checkpoint_key() {
        assert_eq!(
            checkpoint_key("orders", "shardId-000000000001"),
            "shard-checkpoint:orders:shardId-000000000001"
        );
    }

    #[test]
    fn test_decode_records_counts_garbage() {
        let task = Task::new("emails", "send", serde_json::json!({}), Utc::now());
        let records = vec![
            StreamRecord {
                sequence_number: "1".into(),
                partition_key: None,
                data: serde_json::to_vec(&task).unwrap(),
                arrived_at: Utc::now(),
            },
            StreamRecord {
                sequence_number: "2".into(),
                partition_key: None,
                data: b"{broken".to_vec(),
                arrived_at: Utc::now(),
            },
        ];
        let (tasks, undecodable) = decode_records(&records);
        assert_eq!(tasks.len(), 1);
        assert_eq!(undecodable, 1);
    }

    #[test]
    fn test_registry_generation_guard() {
        let registry = ShardRegistry::new();
        let make = |generation| {
            let (stop_tx, _) = watch::channel(false);
            Arc::new(ShardConsumerHandle {
                stream_id: "orders".into(),
                shard_id: "s1".into(),
                generation,
                state: Arc::new(Mutex::new(ConsumerState::Consuming)),
                stop_tx,
                join: Mutex::new(None),
            })
        };

        registry.insert(make(1));
        assert!(registry.insert(make(2)).is_some());
        assert!(!registry.remove_if_generation("orders", "s1", 1));
        assert_eq!(registry.active_shards("orders").len(), 1);
        assert!(registry.remove_if_generation("orders", "s1", 2));
        assert!(registry.is_empty());
    }
}
