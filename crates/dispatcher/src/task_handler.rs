//! 任务调度核心
//!
//! TaskHandler 负责把到期的持久化任务提升到活跃队列、分流新任务、
//! 调用批处理器执行一批任务，并根据结果重试、失败或确认。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskq_core::config::HandlerConfig;
use taskq_core::{
    task_ids, ActiveQueue, AsyncTask, AsyncTaskManager, BatchReport, CleanupStats, Clock,
    PostProcessInput, PostProcessReport, ProcessorOutput, QueueError, QueueResult,
    StorageAdapter, Task, TaskProcessor, TaskStatus,
};
use taskq_infrastructure::LockManager;

use crate::async_manager::AsyncCompletion;
use crate::executor_registry::ExecutorRegistry;
use crate::retry_service::{RetryConfig, RetryDecision, RetryPolicy};
use crate::stats::{DiscardMetrics, QueueStats, QueueStatsTracker};

/// 到期任务提升的全局锁
pub const TASK_PROCESSOR_LOCK: &str = "task_processor";
/// 清理任务的全局锁
pub const TASK_CLEANUP_LOCK: &str = "task_cleanup";

/// add_tasks 的分流结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AddTasksOutcome {
    pub enqueued: usize,
    pub stored: usize,
}

impl AddTasksOutcome {
    pub fn total(&self) -> usize {
        self.enqueued + self.stored
    }
}

pub struct TaskHandler {
    storage: Arc<dyn StorageAdapter>,
    locks: LockManager,
    registry: Arc<ExecutorRegistry>,
    processor: Arc<dyn TaskProcessor>,
    async_manager: Option<Arc<dyn AsyncTaskManager>>,
    clock: Arc<dyn Clock>,
    config: HandlerConfig,
    retry_policy: RetryPolicy,
    stats: QueueStatsTracker,
    discards: DiscardMetrics,
}

impl TaskHandler {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        locks: LockManager,
        registry: Arc<ExecutorRegistry>,
        processor: Arc<dyn TaskProcessor>,
        clock: Arc<dyn Clock>,
        config: HandlerConfig,
    ) -> Self {
        let retry_policy = RetryPolicy::new(RetryConfig {
            default_max_retries: config.default_max_retries,
        });
        let stats =
            QueueStatsTracker::new(config.stats_volume_threshold, config.stats_failure_threshold);
        let discards = DiscardMetrics::new(
            locks.cache().clone(),
            clock.clone(),
            config.discard_sample_rate,
        );
        Self {
            storage,
            locks,
            registry,
            processor,
            async_manager: None,
            clock,
            config,
            retry_policy,
            stats,
            discards,
        }
    }

    pub fn with_async_manager(mut self, manager: Arc<dyn AsyncTaskManager>) -> Self {
        self.async_manager = Some(manager);
        self
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn stats(&self) -> &QueueStatsTracker {
        &self.stats
    }

    pub fn discards(&self) -> &DiscardMetrics {
        &self.discards
    }

    /// 提升到期任务；task_processor 锁被占用时直接跳过
    pub async fn process_mature_tasks(&self, active: &dyn ActiveQueue) -> QueueResult<usize> {
        let ttl = self.config.task_processor_lock_ttl();
        if !self.locks.acquire(TASK_PROCESSOR_LOCK, ttl).await? {
            debug!("task_processor 锁被占用，跳过本轮到期任务提升");
            return Ok(0);
        }

        let result = self.promote_mature_tasks(active).await;

        if let Err(e) = self.locks.release(TASK_PROCESSOR_LOCK).await {
            warn!("释放 task_processor 锁失败: {}", e);
        }
        result
    }

    async fn promote_mature_tasks(&self, active: &dyn ActiveQueue) -> QueueResult<usize> {
        let now = self.clock.now();
        let tasks = self.storage.get_mature_tasks(now).await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let (expired, live): (Vec<Task>, Vec<Task>) =
            tasks.into_iter().partition(|t| t.is_expired(now));
        if !expired.is_empty() {
            let marked = self.storage.mark_tasks_as_expired(&expired).await?;
            info!("{} 个任务已过期，不再执行", marked);
        }

        let mut enqueued = 0;
        for (queue_id, group) in group_by_queue(live) {
            enqueued += active.enqueue(&queue_id, group).await?;
        }
        metrics::counter!("taskq_mature_tasks_promoted_total").increment(enqueued as u64);
        if enqueued > 0 {
            info!("提升了 {} 个到期任务到活跃队列", enqueued);
        }
        Ok(enqueued)
    }

    /// 分流新任务：临近执行的进入活跃队列，其余（以及 force_store）持久化
    pub async fn add_tasks(
        &self,
        active: &dyn ActiveQueue,
        tasks: Vec<Task>,
    ) -> QueueResult<AddTasksOutcome> {
        if tasks.is_empty() {
            return Ok(AddTasksOutcome::default());
        }

        let horizon = self.clock.now() + self.config.immediate_window();
        let namespace = self.registry.namespace();
        let mut immediate: Vec<Task> = Vec::new();
        let mut future: Vec<Task> = Vec::new();

        for mut task in tasks {
            task.queue_id = namespace.apply(&task.queue_id);
            if task.force_store || task.execute_at > horizon {
                future.push(task);
                continue;
            }
            if task.id.is_none() {
                let store_on_failure = self
                    .registry
                    .descriptor_for(&task)
                    .await
                    .is_some_and(|d| d.store_on_failure);
                if store_on_failure {
                    task.id = Some(self.storage.generate_id());
                }
            }
            immediate.push(task);
        }

        let mut outcome = AddTasksOutcome::default();
        if !future.is_empty() {
            let stored = self.storage.add_tasks_to_scheduled(&future).await?;
            if stored.len() < future.len() {
                debug!("{} 个任务因重复被跳过", future.len() - stored.len());
            }
            outcome.stored = stored.len();
        }
        for (queue_id, group) in group_by_queue(immediate) {
            outcome.enqueued += active.enqueue(&queue_id, group).await?;
        }
        Ok(outcome)
    }

    /// 后处理：失败任务重试或结束，新任务分流，成功任务确认
    pub async fn post_process_tasks(
        &self,
        active: &dyn ActiveQueue,
        input: PostProcessInput,
    ) -> QueueResult<PostProcessReport> {
        let now = self.clock.now();
        let mut report = PostProcessReport::default();

        let mut updates = Vec::new();
        let mut rescheduled: HashMap<String, Task> = HashMap::new();
        let mut to_fail = Vec::new();
        let mut to_persist = Vec::new();
        let mut requeue = Vec::new();
        let mut discarded: BTreeMap<String, u64> = BTreeMap::new();

        for task in input.failed_tasks {
            let descriptor = self.registry.descriptor_for(&task).await;
            let decision =
                self.retry_policy
                    .decide(&task, descriptor.as_ref(), now, || self.storage.generate_id());
            match decision {
                RetryDecision::Reschedule(update) => {
                    let mut next = task;
                    update.patch.apply_to(&mut next, now);
                    rescheduled.insert(update.id.clone(), next);
                    updates.push(update);
                    report.rescheduled += 1;
                }
                RetryDecision::Fail => {
                    to_fail.push(task);
                    report.failed += 1;
                }
                RetryDecision::Persist(stored) => {
                    if stored.status == TaskStatus::Failed {
                        report.failed += 1;
                    } else {
                        report.rescheduled += 1;
                    }
                    to_persist.push(stored);
                }
                RetryDecision::Requeue(retry) => {
                    requeue.push(retry);
                    report.requeued += 1;
                }
                RetryDecision::Discard => {
                    *discarded.entry(task.queue_id).or_default() += 1;
                    report.discarded += 1;
                }
            }
        }

        // 只存在于活跃队列中的带id任务在更新时不会命中，改为插入
        if !updates.is_empty() {
            let matched: HashSet<String> =
                self.storage.update_tasks(&updates).await?.into_iter().collect();
            to_persist.extend(
                rescheduled
                    .into_iter()
                    .filter(|(id, _)| !matched.contains(id))
                    .map(|(_, task)| task),
            );
        }

        if !to_fail.is_empty() {
            let marked = self.storage.mark_tasks_as_failed(&to_fail).await?;
            if (marked as usize) < to_fail.len() {
                to_persist.extend(self.missing_from_storage(to_fail, TaskStatus::Failed).await?);
            }
        }

        if !to_persist.is_empty() {
            self.storage.upsert_tasks(&to_persist).await?;
        }

        for (queue_id, group) in group_by_queue(requeue) {
            active.enqueue(&queue_id, group).await?;
        }

        for (queue_id, count) in discarded {
            if let Err(e) = self.discards.record(&queue_id, count).await {
                warn!("记录丢弃任务计数失败: {}", e);
            }
        }

        report.new_tasks = self.add_tasks(active, input.new_tasks).await?.total();

        if !input.success_tasks.is_empty() {
            self.storage
                .mark_tasks_as_executed(&input.success_tasks)
                .await?;
            report.executed = input.success_tasks.len();
        }

        Ok(report)
    }

    /// 存储中不存在的任务按给定状态补写
    async fn missing_from_storage(
        &self,
        tasks: Vec<Task>,
        status: TaskStatus,
    ) -> QueueResult<Vec<Task>> {
        let existing: HashSet<String> =
            task_ids(&self.storage.get_tasks_by_ids(&task_ids(&tasks)).await?)
                .into_iter()
                .collect();
        let now = self.clock.now();
        Ok(tasks
            .into_iter()
            .filter(|t| t.id.as_ref().is_some_and(|id| !existing.contains(id)))
            .map(|mut t| {
                t.status = status;
                t.processing_started_at = None;
                t.updated_at = now;
                t
            })
            .collect())
    }

    /// 执行一批任务并完成后处理
    ///
    /// 处理器返回的错误（例如限流）原样返回，调用方负责重试整批。
    pub async fn execute_batch(
        &self,
        active: &dyn ActiveQueue,
        consumer_label: &str,
        queue_id: &str,
        tasks: Vec<Task>,
    ) -> QueueResult<BatchReport> {
        if tasks.is_empty() {
            return Ok(BatchReport::default());
        }

        let output = self.processor.process(consumer_label, tasks).await?;
        let mut report = BatchReport {
            success_count: output.success_tasks.len(),
            failure_count: output.failed_tasks.len(),
            async_count: output.async_tasks.len(),
            ignored_count: output.ignored_tasks.len(),
            task_types: output.task_types(),
            failed_task_types: output.failed_task_types(),
            throttled: output.throttled,
            ..Default::default()
        };

        let ProcessorOutput {
            success_tasks,
            mut failed_tasks,
            new_tasks,
            async_tasks,
            ignored_tasks,
            ..
        } = output;

        let mut violation = None;
        if !async_tasks.is_empty() {
            match &self.async_manager {
                Some(manager) => {
                    report.deferred_count =
                        self.submit_async(active, manager.as_ref(), async_tasks).await?;
                }
                None => {
                    error!(
                        "[{}] 处理器返回了 {} 个异步任务，但没有配置异步任务管理器",
                        consumer_label,
                        async_tasks.len()
                    );
                    failed_tasks.extend(async_tasks.into_iter().map(|pending| {
                        let mut task = pending.task;
                        task.execution_stats.last_error = Some("没有异步任务管理器".to_string());
                        task
                    }));
                    violation = Some(QueueError::ContractViolation(format!(
                        "队列 {queue_id} 返回了异步任务，但没有配置异步任务管理器"
                    )));
                }
            }
        }

        if !ignored_tasks.is_empty() {
            self.storage.mark_tasks_as_ignored(&ignored_tasks).await?;
        }

        report.post_process = self
            .post_process_tasks(
                active,
                PostProcessInput {
                    failed_tasks,
                    new_tasks,
                    success_tasks,
                },
            )
            .await?;

        self.stats.record(
            queue_id,
            QueueStats {
                success: report.success_count as u64,
                failed: report.failure_count as u64,
                async_count: report.async_count as u64,
                ignored: report.ignored_count as u64,
            },
        );

        match violation {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// 提交异步任务，管理器满载的任务延迟后重新入队，返回延迟的数量
    async fn submit_async(
        &self,
        active: &dyn ActiveQueue,
        manager: &dyn AsyncTaskManager,
        async_tasks: Vec<AsyncTask>,
    ) -> QueueResult<usize> {
        let retry_at = self.clock.now() + self.config.async_requeue_delay();
        let mut deferred = Vec::new();
        for pending in async_tasks {
            if let Err(rejected) = manager.try_submit(pending) {
                let mut task = rejected.task;
                task.execute_at = retry_at;
                deferred.push(task);
            }
        }
        if deferred.is_empty() {
            return Ok(0);
        }

        warn!(
            "异步任务管理器已满 ({}/{})，{} 个任务延迟重新入队",
            manager.in_flight(),
            manager.capacity(),
            deferred.len()
        );
        let count = deferred.len();
        for (queue_id, group) in group_by_queue(deferred) {
            active.enqueue(&queue_id, group).await?;
        }
        Ok(count)
    }

    /// 异步任务完成后的后处理
    pub async fn handle_async_completion(
        &self,
        active: &dyn ActiveQueue,
        completion: AsyncCompletion,
    ) -> QueueResult<PostProcessReport> {
        let AsyncCompletion { mut task, result } = completion;
        let queue_id = task.queue_id.clone();
        let mut input = PostProcessInput::default();
        let mut delta = QueueStats::default();

        match result {
            Ok(value) => {
                let retain = self
                    .registry
                    .descriptor_for(&task)
                    .await
                    .is_some_and(|d| d.retain_result);
                if retain {
                    task.execution_result = value;
                }
                input.success_tasks.push(task);
                delta.success = 1;
            }
            Err(e) => {
                debug!("异步任务 {} 失败: {}", task.describe(), e);
                task.execution_stats.last_error = Some(e.to_string());
                input.failed_tasks.push(task);
                delta.failed = 1;
            }
        }

        let report = self.post_process_tasks(active, input).await?;
        self.stats.record(&queue_id, delta);
        Ok(report)
    }

    /// 清理长时间停留在 processing 的任务与超过保留期的已结束任务
    pub async fn cleanup_once(&self) -> QueueResult<Option<CleanupStats>> {
        let ttl = self.config.task_processor_lock_ttl();
        if !self.locks.acquire(TASK_CLEANUP_LOCK, ttl).await? {
            debug!("task_cleanup 锁被占用，跳过本轮清理");
            return Ok(None);
        }

        let result = self.run_cleanup().await;

        if let Err(e) = self.locks.release(TASK_CLEANUP_LOCK).await {
            warn!("释放 task_cleanup 锁失败: {}", e);
        }
        result.map(Some)
    }

    async fn run_cleanup(&self) -> QueueResult<CleanupStats> {
        let now = self.clock.now();
        let orphaned_before = now - ChronoDuration::hours(self.config.orphaned_after_hours);
        let expired_before = now - ChronoDuration::days(self.config.retention_days);

        let pending = self
            .storage
            .get_cleanup_stats(orphaned_before, expired_before)
            .await?;
        if pending.total() == 0 {
            return Ok(pending);
        }

        let removed = self
            .storage
            .cleanup_tasks(orphaned_before, expired_before)
            .await?;
        info!(
            "清理完成: 孤立任务 {} 个, 过期任务 {} 个",
            removed.orphaned, removed.expired
        );
        Ok(removed)
    }

    /// 强制上报所有队列统计
    pub fn flush_stats(&self) {
        let flushed = self.stats.flush_all();
        debug!("已上报 {} 个队列的统计", flushed.len());
    }

    /// 启动到期任务提升、清理与异步完成处理循环
    pub fn start(
        self: &Arc<Self>,
        active: Arc<dyn ActiveQueue>,
        completions: Option<mpsc::UnboundedReceiver<AsyncCompletion>>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.clone().run_mature_loop(active.clone(), shutdown.clone())),
            tokio::spawn(self.clone().run_cleanup_loop(shutdown.clone())),
        ];
        if let Some(rx) = completions {
            handles.push(tokio::spawn(self.clone().run_completion_loop(
                active, rx, shutdown,
            )));
        }
        handles
    }

    async fn run_mature_loop(
        self: Arc<Self>,
        active: Arc<dyn ActiveQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.config.mature_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "到期任务提升循环已启动，间隔 {:?}",
            self.config.mature_poll_interval()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_mature_tasks(active.as_ref()).await {
                        error!("提升到期任务失败: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("收到关闭信号，停止到期任务提升循环");
                    break;
                }
            }
        }
    }

    async fn run_cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup_once().await {
                        error!("清理任务失败: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("收到关闭信号，停止清理循环");
                    break;
                }
            }
        }
    }

    async fn run_completion_loop(
        self: Arc<Self>,
        active: Arc<dyn ActiveQueue>,
        mut completions: mpsc::UnboundedReceiver<AsyncCompletion>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = completions.recv() => {
                    let Some(completion) = maybe else { break };
                    if let Err(e) = self.handle_async_completion(active.as_ref(), completion).await {
                        error!("异步任务后处理失败: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("收到关闭信号，停止异步任务完成处理");
                    break;
                }
            }
        }
    }
}

fn group_by_queue(tasks: Vec<Task>) -> BTreeMap<String, Vec<Task>> {
    let mut groups: BTreeMap<String, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.queue_id.clone()).or_default().push(task);
    }
    groups
}
