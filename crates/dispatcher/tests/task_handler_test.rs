use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use taskq_core::config::HandlerConfig;
use taskq_core::{
    ActiveQueue, AsyncTaskManager, CacheProvider, Clock, PostProcessInput, QueueError,
    QueueNamespace, StorageAdapter, Task, TaskStatus,
};
use taskq_infrastructure::{InMemoryActiveQueue, LockManager, SqliteTaskStorage};
use taskq_testing_utils::{
    setup_active_queue, setup_document_storage, setup_locks, setup_test_storage, ManualClock,
    Script, ScriptedExecutor, TaskBuilder,
};
use tokio::sync::watch;

use taskq_dispatcher::{
    BoundedAsyncTaskManager, DiscardMetrics, ExecutorDescriptor, ExecutorRegistry,
    RegistryProcessor, TaskHandler, TASK_PROCESSOR_LOCK,
};

const QUEUE: &str = "emails";
const TASK_TYPE: &str = "send";

struct Harness {
    clock: ManualClock,
    storage: Arc<SqliteTaskStorage>,
    active: Arc<InMemoryActiveQueue>,
    cache: Arc<dyn CacheProvider>,
    handler: TaskHandler,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

async fn setup(descriptor: ExecutorDescriptor) -> Harness {
    let clock = ManualClock::new(start_time());
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let storage = Arc::new(setup_test_storage(shared_clock.clone()).await);
    let (cache, locks) = setup_locks("instance-a");

    let registry = Arc::new(ExecutorRegistry::new(QueueNamespace::default()));
    registry.register(QUEUE, TASK_TYPE, descriptor).await;
    let processor = Arc::new(RegistryProcessor::new(registry.clone()));

    let handler = TaskHandler::new(
        storage.clone(),
        locks,
        registry,
        processor,
        shared_clock,
        HandlerConfig::default(),
    );

    Harness {
        clock,
        storage,
        active: setup_active_queue(),
        cache,
        handler,
    }
}

/// 写入一个已到期任务并认领，返回 processing 状态的任务
async fn claimed_task(harness: &Harness, retries: u32, retry_after_ms: u64) -> Task {
    let task = TaskBuilder::new(QUEUE, TASK_TYPE)
        .execute_at(start_time())
        .with_retries(retries)
        .retry_after_ms(retry_after_ms)
        .build();
    harness.storage.add_tasks_to_scheduled(&[task]).await.unwrap();
    let mut claimed = harness
        .storage
        .get_mature_tasks(harness.clock.now())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    claimed.remove(0)
}

async fn reload(harness: &Harness, task: &Task) -> Task {
    let id = task.id.clone().unwrap();
    harness
        .storage
        .get_tasks_by_ids(&[id])
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
}

fn failed_input(task: Task) -> PostProcessInput {
    PostProcessInput {
        failed_tasks: vec![task],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_first_retry_reschedules_after_base_delay() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let task = claimed_task(&harness, 0, 1000).await;

    let report = harness
        .handler
        .post_process_tasks(harness.active.as_ref(), failed_input(task.clone()))
        .await
        .unwrap();
    assert_eq!(report.rescheduled, 1);

    let stored = reload(&harness, &task).await;
    assert_eq!(stored.status, TaskStatus::Scheduled);
    assert_eq!(stored.execute_at, start_time() + Duration::milliseconds(1000));
    assert_eq!(stored.execution_stats.retry_count, 1);
    assert!(stored.processing_started_at.is_none());
}

#[tokio::test]
async fn test_third_retry_uses_quadratic_backoff() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let task = claimed_task(&harness, 2, 2000).await;

    harness
        .handler
        .post_process_tasks(harness.active.as_ref(), failed_input(task.clone()))
        .await
        .unwrap();

    let stored = reload(&harness, &task).await;
    assert_eq!(stored.execute_at, start_time() + Duration::milliseconds(18000));
    assert_eq!(stored.execution_stats.retry_count, 3);
}

#[tokio::test]
async fn test_exhausted_persisted_task_is_failed() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let task = claimed_task(&harness, 3, 1000).await;

    let report = harness
        .handler
        .post_process_tasks(harness.active.as_ref(), failed_input(task.clone()))
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(reload(&harness, &task).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_exhausted_transient_task_is_discarded_and_counted() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let task = TaskBuilder::new(QUEUE, TASK_TYPE).with_retries(3).build();

    let report = harness
        .handler
        .post_process_tasks(harness.active.as_ref(), failed_input(task))
        .await
        .unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(harness.active.len(QUEUE).await.unwrap(), 0);
    let key = DiscardMetrics::bucket_key(start_time());
    assert_eq!(harness.cache.get(&key).await.unwrap().as_deref(), Some("1"));
    assert_eq!(harness.handler.discards().total_24h().await.unwrap(), 1);
}

#[tokio::test]
async fn test_transient_task_with_budget_is_requeued_in_memory() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let task = TaskBuilder::new(QUEUE, TASK_TYPE)
        .execute_at(start_time())
        .retry_after_ms(500)
        .build();

    let report = harness
        .handler
        .post_process_tasks(harness.active.as_ref(), failed_input(task))
        .await
        .unwrap();

    assert_eq!(report.requeued, 1);
    let queued = harness.active.snapshot(QUEUE).await;
    assert_eq!(queued.len(), 1);
    assert!(queued[0].id.is_none());
    assert_eq!(queued[0].execute_at, start_time() + Duration::milliseconds(500));
}

#[tokio::test]
async fn test_store_on_failure_persists_transient_task() {
    let harness = setup(
        ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding())).store_on_failure(),
    )
    .await;
    let task = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();

    let outcome = harness
        .handler
        .add_tasks(harness.active.as_ref(), vec![task])
        .await
        .unwrap();
    assert_eq!(outcome.enqueued, 1);
    let queued = harness
        .active
        .dequeue_batch(QUEUE, 10, start_time())
        .await
        .unwrap();
    assert!(queued[0].id.is_some(), "store_on_failure 的任务入队时获得id");

    harness
        .handler
        .post_process_tasks(harness.active.as_ref(), failed_input(queued[0].clone()))
        .await
        .unwrap();

    let stored = reload(&harness, &queued[0]).await;
    assert_eq!(stored.status, TaskStatus::Scheduled);
    assert_eq!(stored.execution_stats.retry_count, 1);
}

#[tokio::test]
async fn test_add_tasks_splits_by_window_and_force_store() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let soon = TaskBuilder::new(QUEUE, TASK_TYPE)
        .execute_at(start_time() + Duration::seconds(30))
        .build();
    let later = TaskBuilder::new(QUEUE, TASK_TYPE)
        .execute_at(start_time() + Duration::hours(1))
        .build();
    let forced = TaskBuilder::new(QUEUE, TASK_TYPE)
        .execute_at(start_time())
        .force_store()
        .build();

    let outcome = harness
        .handler
        .add_tasks(harness.active.as_ref(), vec![soon, later, forced])
        .await
        .unwrap();

    assert_eq!(outcome.enqueued, 1);
    assert_eq!(outcome.stored, 2);
    assert_eq!(harness.active.len(QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_process_mature_tasks_promotes_and_releases_lock() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let due = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();
    let expired = TaskBuilder::new(QUEUE, TASK_TYPE)
        .execute_at(start_time())
        .expires_at(start_time() - Duration::minutes(1))
        .build();
    let persisted = harness
        .storage
        .add_tasks_to_scheduled(&[due, expired])
        .await
        .unwrap();

    let promoted = harness
        .handler
        .process_mature_tasks(harness.active.as_ref())
        .await
        .unwrap();

    assert_eq!(promoted, 1);
    assert_eq!(harness.active.len(QUEUE).await.unwrap(), 1);
    assert_eq!(reload(&harness, &persisted[1]).await.status, TaskStatus::Expired);
    assert!(!harness
        .handler
        .locks()
        .is_locked(TASK_PROCESSOR_LOCK)
        .await
        .unwrap());

    // 再次轮询不会重复认领
    let again = harness
        .handler
        .process_mature_tasks(harness.active.as_ref())
        .await
        .unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_process_mature_tasks_skips_when_lock_held_elsewhere() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let other = LockManager::new(harness.cache.clone(), "instance-b");
    assert!(other
        .acquire(TASK_PROCESSOR_LOCK, StdDuration::from_secs(60))
        .await
        .unwrap());

    let task = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();
    let persisted = harness.storage.add_tasks_to_scheduled(&[task]).await.unwrap();

    let promoted = harness
        .handler
        .process_mature_tasks(harness.active.as_ref())
        .await
        .unwrap();

    assert_eq!(promoted, 0);
    assert_eq!(reload(&harness, &persisted[0]).await.status, TaskStatus::Scheduled);
    assert!(other.is_held(TASK_PROCESSOR_LOCK).await.unwrap());
}

#[tokio::test]
async fn test_execute_batch_marks_unknown_types_ignored() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let known = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();
    let unknown = TaskBuilder::new(QUEUE, "mystery").execute_at(start_time()).build();
    harness
        .storage
        .add_tasks_to_scheduled(&[known, unknown])
        .await
        .unwrap();
    let claimed = harness.storage.get_mature_tasks(start_time()).await.unwrap();

    let report = harness
        .handler
        .execute_batch(harness.active.as_ref(), "test", QUEUE, claimed.clone())
        .await
        .unwrap();

    assert_eq!(report.success_count, 1);
    assert_eq!(report.ignored_count, 1);
    for task in &claimed {
        let expected = if task.task_type == TASK_TYPE {
            TaskStatus::Executed
        } else {
            TaskStatus::Ignored
        };
        assert_eq!(reload(&harness, task).await.status, expected);
    }
    assert_eq!(harness.handler.stats().current(QUEUE).success, 1);
}

#[tokio::test]
async fn test_retained_result_is_saved_on_success() {
    let harness = setup(
        ExecutorDescriptor::new(Arc::new(ScriptedExecutor::always(Script::Succeed(Some(
            serde_json::json!({"delivered": true}),
        )))))
        .retain_result(),
    )
    .await;
    let task = claimed_task(&harness, 0, 1000).await;

    harness
        .handler
        .execute_batch(harness.active.as_ref(), "test", QUEUE, vec![task.clone()])
        .await
        .unwrap();

    let stored = reload(&harness, &task).await;
    assert_eq!(stored.status, TaskStatus::Executed);
    assert_eq!(
        stored.execution_result,
        Some(serde_json::json!({"delivered": true}))
    );
}

#[tokio::test]
async fn test_async_task_without_manager_is_contract_violation() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::always(
        Script::InFlight(Ok(None)),
    ))))
    .await;
    let task = claimed_task(&harness, 0, 1000).await;

    let result = harness
        .handler
        .execute_batch(harness.active.as_ref(), "test", QUEUE, vec![task.clone()])
        .await;

    assert!(matches!(result, Err(QueueError::ContractViolation(_))));
    // 任务没有丢失，进入了重试流程
    assert_eq!(reload(&harness, &task).await.execution_stats.retry_count, 1);
}

#[tokio::test]
async fn test_async_task_requeued_when_manager_full() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::always(
        Script::InFlight(Ok(None)),
    ))))
    .await;
    let (manager, _completions) = BoundedAsyncTaskManager::new(1);
    let manager: Arc<dyn AsyncTaskManager> = Arc::new(manager);
    let handler = harness.handler.with_async_manager(manager);

    let first = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();
    let second = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();

    // 单线程运行时下第一个异步任务尚未被调度，许可仍被占用
    let report = handler
        .execute_batch(harness.active.as_ref(), "test", QUEUE, vec![first, second])
        .await
        .unwrap();

    assert_eq!(report.async_count, 2);
    assert_eq!(report.deferred_count, 1);
    let queued = harness.active.snapshot(QUEUE).await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].execute_at, start_time() + Duration::seconds(30));
}

#[tokio::test]
async fn test_async_completion_marks_task_executed() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::always(
        Script::InFlight(Ok(Some(serde_json::json!("ok")))),
    ))))
    .await;
    let (manager, mut completions) = BoundedAsyncTaskManager::new(4);
    let handler = harness.handler.with_async_manager(Arc::new(manager));
    let task = {
        let t = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();
        harness.storage.add_tasks_to_scheduled(&[t]).await.unwrap();
        harness
            .storage
            .get_mature_tasks(start_time())
            .await
            .unwrap()
            .remove(0)
    };

    handler
        .execute_batch(harness.active.as_ref(), "test", QUEUE, vec![task.clone()])
        .await
        .unwrap();
    let completion = completions.recv().await.unwrap();
    handler
        .handle_async_completion(harness.active.as_ref(), completion)
        .await
        .unwrap();

    let id = task.id.clone().unwrap();
    let stored = harness.storage.get_tasks_by_ids(&[id]).await.unwrap();
    assert_eq!(stored[0].status, TaskStatus::Executed);

    // 派发与完成只在成功里计入一次吞吐
    let stats = handler.stats().current(QUEUE);
    assert_eq!(stats.async_count, 1);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.volume(), 1);
}

#[tokio::test]
async fn test_cleanup_removes_old_terminal_tasks() {
    let harness = setup(ExecutorDescriptor::new(Arc::new(ScriptedExecutor::succeeding()))).await;
    let task = claimed_task(&harness, 0, 1000).await;
    harness
        .storage
        .mark_tasks_as_executed(&[task.clone()])
        .await
        .unwrap();

    harness.clock.advance(Duration::days(8));
    let stats = harness.handler.cleanup_once().await.unwrap().unwrap();

    assert_eq!(stats.expired, 1);
    assert!(harness
        .storage
        .get_tasks_by_ids(&[task.id.unwrap()])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_mature_loop_promotes_until_shutdown() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start_time()));
    let storage = Arc::new(setup_document_storage(clock.clone()));
    let (_cache, locks) = setup_locks("instance-a");
    let registry = Arc::new(ExecutorRegistry::new(QueueNamespace::default()));
    let processor = Arc::new(RegistryProcessor::new(registry.clone()));
    let handler = Arc::new(TaskHandler::new(
        storage.clone(),
        locks,
        registry,
        processor,
        clock,
        HandlerConfig::default(),
    ));
    let active = setup_active_queue();

    let task = TaskBuilder::new(QUEUE, TASK_TYPE).execute_at(start_time()).build();
    storage.add_tasks_to_scheduled(&[task]).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = handler.start(active.clone(), None, shutdown_rx);

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert_eq!(active.len(QUEUE).await.unwrap(), 1);

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
