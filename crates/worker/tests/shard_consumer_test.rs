use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use taskq_core::config::{AdaptiveConfig, HandlerConfig, RebalancerConfig};
use taskq_core::{
    system_clock, CacheProvider, Clock, ProcessorOutput, QueueError, QueueNamespace, QueueResult,
    ShardLeaser, Task, TaskProcessor,
};
use taskq_dispatcher::{ExecutorRegistry, TaskHandler};
use taskq_infrastructure::{
    CacheShardLeaser, InMemoryPartitionedStream, LockManager, INSTANCE_PREFIX, LOCK_PREFIX,
};
use taskq_testing_utils::{
    setup_active_queue, setup_document_storage, setup_locks, RecordingProcessor, TaskBuilder,
    TestEnv,
};
use taskq_worker::{
    checkpoint_key, AdaptiveStrategy, ConsumerContext, HookEvent, ShardLifecycleHook,
    ShardRebalancer, WorkerPool,
};

const STREAM: &str = "orders";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingHook {
    events: Mutex<Vec<(HookEvent, String)>>,
}

impl RecordingHook {
    fn events(&self) -> Vec<(HookEvent, String)> {
        self.events.lock().unwrap().clone()
    }

    fn saw(&self, event: HookEvent, shard_id: &str) -> bool {
        self.events()
            .iter()
            .any(|(e, s)| *e == event && s == shard_id)
    }

    fn push(&self, event: HookEvent, shard_id: &str) {
        self.events.lock().unwrap().push((event, shard_id.to_string()));
    }
}

#[async_trait]
impl ShardLifecycleHook for RecordingHook {
    async fn on_shard_acquired(&self, _stream_id: &str, shard_id: &str) -> anyhow::Result<()> {
        self.push(HookEvent::Acquired, shard_id);
        Ok(())
    }

    async fn on_shard_lost(&self, _stream_id: &str, shard_id: &str) -> anyhow::Result<()> {
        self.push(HookEvent::Lost, shard_id);
        Ok(())
    }

    async fn on_shard_released(&self, _stream_id: &str, shard_id: &str) -> anyhow::Result<()> {
        self.push(HookEvent::Released, shard_id);
        Ok(())
    }
}

fn fast_config() -> RebalancerConfig {
    RebalancerConfig {
        enabled: true,
        streams: vec![STREAM.to_string()],
        interval_ms: 50,
        backoff_poll_ms: 10,
        idle_poll_ms: 10,
        stop_timeout_ms: 1000,
        ..Default::default()
    }
}

fn fast_adaptive() -> AdaptiveConfig {
    AdaptiveConfig {
        base_delay_ms: 1,
        max_delay_ms: 20,
        ..Default::default()
    }
}

struct Instance {
    rebalancer: Arc<ShardRebalancer>,
    strategy: Arc<AdaptiveStrategy>,
    hook: Arc<RecordingHook>,
    shutdown_tx: watch::Sender<bool>,
}

impl Instance {
    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.rebalancer.shutdown().await;
    }
}

fn instance(
    id: &str,
    cache: Arc<dyn CacheProvider>,
    stream: Arc<InMemoryPartitionedStream>,
    processor: Arc<RecordingProcessor>,
) -> Instance {
    let config = fast_config();
    let leaser = Arc::new(CacheShardLeaser::new(
        cache.clone(),
        id,
        config.heartbeat_ttl(),
        config.lease_ttl(),
    ));
    build_instance(id, cache, stream, processor, fast_adaptive(), leaser)
}

fn build_instance(
    id: &str,
    cache: Arc<dyn CacheProvider>,
    stream: Arc<InMemoryPartitionedStream>,
    processor: Arc<dyn TaskProcessor>,
    adaptive: AdaptiveConfig,
    leaser: Arc<dyn ShardLeaser>,
) -> Instance {
    let clock: Arc<dyn Clock> = system_clock();
    let config = fast_config();
    let storage = Arc::new(setup_document_storage(clock.clone()));
    let registry = Arc::new(ExecutorRegistry::new(QueueNamespace::default()));
    let handler = Arc::new(TaskHandler::new(
        storage,
        LockManager::new(cache.clone(), id),
        registry,
        processor,
        clock.clone(),
        HandlerConfig::default(),
    ));
    let strategy = Arc::new(AdaptiveStrategy::new(adaptive, clock));
    let hook = Arc::new(RecordingHook::default());

    let ctx = Arc::new(ConsumerContext {
        stream,
        leaser,
        cache,
        strategy: strategy.clone(),
        handler,
        active: setup_active_queue(),
        pool: WorkerPool::new(4),
        hook: hook.clone(),
        config,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Instance {
        rebalancer: Arc::new(ShardRebalancer::new(ctx, shutdown_rx)),
        strategy,
        hook,
        shutdown_tx,
    }
}

/// 执行时直接 panic 的处理器
struct PanickingProcessor;

#[async_trait]
impl TaskProcessor for PanickingProcessor {
    async fn process(&self, _label: &str, _tasks: Vec<Task>) -> QueueResult<ProcessorOutput> {
        panic!("处理器崩溃");
    }
}

/// 可以让心跳失败的租约包装
struct FlakyLeaser {
    inner: CacheShardLeaser,
    fail_heartbeat: AtomicBool,
}

#[async_trait]
impl ShardLeaser for FlakyLeaser {
    fn instance_id(&self) -> &str {
        self.inner.instance_id()
    }

    async fn heartbeat(&self) -> QueueResult<()> {
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            return Err(QueueError::Cache("连接被拒绝".to_string()));
        }
        self.inner.heartbeat().await
    }

    async fn get_active_instances(&self) -> QueueResult<Vec<String>> {
        self.inner.get_active_instances().await
    }

    async fn acquire_lock(&self, stream_id: &str, shard_id: &str) -> QueueResult<bool> {
        self.inner.acquire_lock(stream_id, shard_id).await
    }

    async fn release_lock(&self, stream_id: &str, shard_id: &str) -> QueueResult<()> {
        self.inner.release_lock(stream_id, shard_id).await
    }

    async fn is_lock_held(&self, stream_id: &str, shard_id: &str) -> QueueResult<bool> {
        self.inner.is_lock_held(stream_id, shard_id).await
    }

    async fn deregister(&self) -> QueueResult<()> {
        self.inner.deregister().await
    }
}

fn lease_key(shard_id: &str) -> String {
    format!("{LOCK_PREFIX}shard:{STREAM}:{shard_id}")
}

fn order(n: u64) -> Task {
    TaskBuilder::new("billing", "charge")
        .with_payload(serde_json::json!({ "order": n }))
        .execute_at(Utc::now())
        .build()
}

type SingleInstance = (
    Instance,
    Arc<InMemoryPartitionedStream>,
    Arc<RecordingProcessor>,
    Arc<dyn CacheProvider>,
    Vec<String>,
);

async fn single_instance(shards: usize) -> SingleInstance {
    let (cache, _) = setup_locks("unused");
    let stream = Arc::new(InMemoryPartitionedStream::new());
    let shard_ids = stream.create_stream(STREAM, shards).await;
    let processor = Arc::new(RecordingProcessor::new());
    let node = instance("node-a", cache.clone(), stream.clone(), processor.clone());
    (node, stream, processor, cache, shard_ids)
}

#[tokio::test]
async fn test_two_instances_split_shards() {
    let (cache, _) = setup_locks("unused");
    let stream = Arc::new(InMemoryPartitionedStream::new());
    stream.create_stream(STREAM, 2).await;
    let processor = Arc::new(RecordingProcessor::new());

    let a = instance("node-a", cache.clone(), stream.clone(), processor.clone());
    let b = instance("node-b", cache.clone(), stream.clone(), processor.clone());

    // 先让两个实例都登记存活，再分别计算分配
    let leaser_b = CacheShardLeaser::new(
        cache.clone(),
        "node-b",
        Duration::from_secs(45),
        Duration::from_secs(60),
    );
    leaser_b.heartbeat().await.unwrap();

    let outcome_a = a.rebalancer.rebalance_once(STREAM).await.unwrap();
    let outcome_b = b.rebalancer.rebalance_once(STREAM).await.unwrap();

    assert_eq!(outcome_a.acquired.len(), 1);
    assert_eq!(outcome_b.acquired.len(), 1);
    assert_ne!(outcome_a.acquired, outcome_b.acquired);
    assert!(outcome_a.contended.is_empty());
    assert!(outcome_b.contended.is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_instance_joining_takes_over_half() {
    let (cache, _) = setup_locks("unused");
    let stream = Arc::new(InMemoryPartitionedStream::new());
    stream.create_stream(STREAM, 2).await;
    let processor = Arc::new(RecordingProcessor::new());

    let a = instance("node-a", cache.clone(), stream.clone(), processor.clone());
    let first = a.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(first.acquired.len(), 2);

    let b = instance("node-b", cache.clone(), stream.clone(), processor.clone());
    // b 登记后租约仍由 a 持有
    let contended = b.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert!(contended.acquired.is_empty());
    assert_eq!(contended.contended.len(), 1);

    let second = a.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(second.released.len(), 1);
    assert!(a.hook.saw(HookEvent::Released, &second.released[0]));

    let taken = b.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(taken.acquired, second.released);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_consumer_processes_records_and_checkpoints() {
    let (node, stream, processor, cache, shards) = single_instance(1).await;
    let shard = &shards[0];
    let mut last = String::new();
    for n in 0..3 {
        last = stream.put_task(STREAM, shard, &order(n)).await.unwrap();
    }

    node.rebalancer.rebalance_once(STREAM).await.unwrap();

    assert!(TestEnv::wait_for(|| async { processor.processed_tasks().len() == 3 }, WAIT).await);
    let key = checkpoint_key(STREAM, shard);
    assert!(
        TestEnv::wait_for(
            || async { cache.get(&key).await.unwrap().as_deref() == Some(last.as_str()) },
            WAIT
        )
        .await
    );
    assert!(processor
        .batches()
        .iter()
        .all(|(label, _)| label == &format!("shard:{STREAM}:{shard}")));
    assert!(node.hook.saw(HookEvent::Acquired, shard));

    node.stop().await;
}

#[tokio::test]
async fn test_consumer_resumes_after_checkpoint() {
    let (node, stream, processor, cache, shards) = single_instance(1).await;
    let shard = &shards[0];
    let first = stream.put_task(STREAM, shard, &order(1)).await.unwrap();
    stream.put_task(STREAM, shard, &order(2)).await.unwrap();
    cache
        .set(&checkpoint_key(STREAM, shard), &first, None)
        .await
        .unwrap();

    node.rebalancer.rebalance_once(STREAM).await.unwrap();

    assert!(TestEnv::wait_for(|| async { !processor.processed_tasks().is_empty() }, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let processed = processor.processed_tasks();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].payload["order"], 2);

    node.stop().await;
}

#[tokio::test]
async fn test_throttled_batch_retried_from_same_checkpoint() {
    let (node, stream, processor, _cache, shards) = single_instance(1).await;
    let shard = &shards[0];
    stream.put_task(STREAM, shard, &order(1)).await.unwrap();
    stream.put_task(STREAM, shard, &order(2)).await.unwrap();
    processor.throttle_next(1);

    node.rebalancer.rebalance_once(STREAM).await.unwrap();

    assert!(TestEnv::wait_for(|| async { processor.processed_tasks().len() == 2 }, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // 限流的那次调用没有推进检查点，两条记录各只被成功处理一次
    assert_eq!(processor.processed_tasks().len(), 2);

    node.stop().await;
}

#[tokio::test]
async fn test_undecodable_record_shrinks_batch() {
    let (node, stream, processor, _cache, shards) = single_instance(1).await;
    let shard = shards[0].clone();
    stream
        .put_record(STREAM, &shard, b"not a task".to_vec())
        .await
        .unwrap();
    stream.put_task(STREAM, &shard, &order(1)).await.unwrap();

    node.rebalancer.rebalance_once(STREAM).await.unwrap();

    let default_size = AdaptiveConfig::default().default_batch_size;
    let strategy = node.strategy.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let strategy = strategy.clone();
                let shard = shard.clone();
                async move { strategy.get_batch_size(STREAM, &shard) < default_size }
            },
            WAIT
        )
        .await
    );
    // 可解析的记录照常处理
    assert_eq!(processor.processed_tasks().len(), 1);

    node.stop().await;
}

#[tokio::test]
async fn test_lost_lease_stops_consumer() {
    let (node, _stream, _processor, cache, shards) = single_instance(1).await;
    let shard = shards[0].clone();

    node.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(node.rebalancer.registry().len(), 1);

    cache
        .set(&lease_key(&shard), "node-intruder", Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let hook = node.hook.clone();
    assert!(TestEnv::wait_for(|| async { hook.saw(HookEvent::Lost, &shard) }, WAIT).await);
    assert!(
        TestEnv::wait_for(|| async { node.rebalancer.registry().is_empty() }, WAIT).await
    );
    // 丢失的租约不会被释放
    assert_eq!(
        cache.get(&lease_key(&shard)).await.unwrap().as_deref(),
        Some("node-intruder")
    );
    assert!(!hook.saw(HookEvent::Released, &shard));

    node.stop().await;
}

#[tokio::test]
async fn test_closed_shard_releases_lease() {
    let (node, stream, processor, cache, shards) = single_instance(1).await;
    let shard = shards[0].clone();
    stream.put_task(STREAM, &shard, &order(1)).await.unwrap();
    stream.close_shard(STREAM, &shard).await;

    node.rebalancer.rebalance_once(STREAM).await.unwrap();

    let hook = node.hook.clone();
    assert!(TestEnv::wait_for(|| async { hook.saw(HookEvent::Released, &shard) }, WAIT).await);
    assert_eq!(processor.processed_tasks().len(), 1);
    assert!(cache.get(&lease_key(&shard)).await.unwrap().is_none());
    assert!(node.rebalancer.registry().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_fetch_errors_give_up_shard() {
    let (node, stream, _processor, _cache, shards) = single_instance(1).await;
    let shard = shards[0].clone();
    for _ in 0..fast_config().max_fetch_errors {
        stream
            .fail_next_fetch(
                STREAM,
                &shard,
                taskq_core::QueueError::Stream("连接被重置".to_string()),
            )
            .await;
    }

    node.rebalancer.rebalance_once(STREAM).await.unwrap();

    let hook = node.hook.clone();
    assert!(TestEnv::wait_for(|| async { hook.saw(HookEvent::Released, &shard) }, WAIT).await);
    assert!(node.rebalancer.registry().is_empty());

    node.stop().await;
}

#[tokio::test]
async fn test_shutdown_releases_leases_and_deregisters() {
    let (node, _stream, _processor, cache, shards) = single_instance(2).await;
    node.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(node.rebalancer.registry().len(), 2);

    node.stop().await;

    assert!(node.rebalancer.registry().is_empty());
    for shard in &shards {
        assert!(cache.get(&lease_key(shard)).await.unwrap().is_none());
    }
    assert!(cache.scan_prefix(INSTANCE_PREFIX).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rebalance_without_shards_is_noop() {
    let (cache, _) = setup_locks("unused");
    let stream = Arc::new(InMemoryPartitionedStream::new());
    let node = instance(
        "node-a",
        cache,
        stream,
        Arc::new(RecordingProcessor::new()),
    );

    let outcome = node.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(outcome, Default::default());

    node.stop().await;
}

#[tokio::test]
async fn test_same_shard_id_on_two_streams_keeps_separate_state() {
    let (cache, _) = setup_locks("unused");
    let stream = Arc::new(InMemoryPartitionedStream::new());
    let orders = stream.create_stream(STREAM, 1).await;
    let events = stream.create_stream("events", 1).await;
    assert_eq!(orders, events);
    let shard = orders[0].clone();

    let processor = Arc::new(RecordingProcessor::new());
    let config = fast_config();
    let leaser = Arc::new(CacheShardLeaser::new(
        cache.clone(),
        "node-a",
        config.heartbeat_ttl(),
        config.lease_ttl(),
    ));
    let adaptive = AdaptiveConfig {
        backoff_threshold: 1,
        max_backoff_ms: 60_000,
        ..fast_adaptive()
    };
    let node = build_instance(
        "node-a",
        cache,
        stream.clone(),
        processor.clone(),
        adaptive,
        leaser,
    );

    stream
        .put_record(STREAM, &shard, b"not a task".to_vec())
        .await
        .unwrap();
    node.rebalancer.rebalance_once(STREAM).await.unwrap();

    let strategy = node.strategy.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let strategy = strategy.clone();
                let shard = shard.clone();
                async move { strategy.should_backoff(STREAM, &shard) }
            },
            WAIT
        )
        .await
    );
    assert!(!strategy.should_backoff("events", &shard));
    assert_eq!(
        strategy.get_batch_size("events", &shard),
        fast_adaptive().default_batch_size
    );

    stream.put_task("events", &shard, &order(7)).await.unwrap();
    node.rebalancer.rebalance_once("events").await.unwrap();
    let processed = processor.clone();
    assert!(
        TestEnv::wait_for(
            || async { processed.processed_tasks().len() == 1 },
            Duration::from_millis(500)
        )
        .await
    );

    node.stop().await;
}

#[tokio::test]
async fn test_panicking_processor_still_cleans_up() {
    let (cache, _) = setup_locks("unused");
    let stream = Arc::new(InMemoryPartitionedStream::new());
    let shards = stream.create_stream(STREAM, 1).await;
    let shard = shards[0].clone();
    stream.put_task(STREAM, &shard, &order(1)).await.unwrap();

    let config = fast_config();
    let leaser = Arc::new(CacheShardLeaser::new(
        cache.clone(),
        "node-a",
        config.heartbeat_ttl(),
        config.lease_ttl(),
    ));
    let node = build_instance(
        "node-a",
        cache.clone(),
        stream,
        Arc::new(PanickingProcessor),
        fast_adaptive(),
        leaser,
    );

    let outcome = node.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(outcome.acquired, vec![shard.clone()]);

    let hook = node.hook.clone();
    assert!(TestEnv::wait_for(|| async { hook.saw(HookEvent::Released, &shard) }, WAIT).await);
    assert!(node.rebalancer.registry().is_empty());
    assert!(cache.get(&lease_key(&shard)).await.unwrap().is_none());
    assert!(!hook.saw(HookEvent::Lost, &shard));

    // 下一轮可以重新获取该分片
    let outcome = node.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(outcome.acquired, vec![shard.clone()]);

    node.stop().await;
}

#[tokio::test]
async fn test_failed_heartbeat_releases_stream() {
    let (cache, _) = setup_locks("unused");
    let stream = Arc::new(InMemoryPartitionedStream::new());
    let shards = stream.create_stream(STREAM, 2).await;

    let config = fast_config();
    let leaser = Arc::new(FlakyLeaser {
        inner: CacheShardLeaser::new(
            cache.clone(),
            "node-a",
            config.heartbeat_ttl(),
            config.lease_ttl(),
        ),
        fail_heartbeat: AtomicBool::new(false),
    });
    let node = build_instance(
        "node-a",
        cache.clone(),
        stream,
        Arc::new(RecordingProcessor::new()),
        fast_adaptive(),
        leaser.clone(),
    );

    node.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(node.rebalancer.registry().len(), 2);

    leaser.fail_heartbeat.store(true, Ordering::SeqCst);
    let mut outcome = node.rebalancer.rebalance_once(STREAM).await.unwrap();
    outcome.released.sort();

    assert_eq!(outcome.released, shards);
    assert!(outcome.acquired.is_empty());
    assert!(node.rebalancer.registry().is_empty());
    for shard in &shards {
        assert!(cache.get(&lease_key(shard)).await.unwrap().is_none());
    }

    leaser.fail_heartbeat.store(false, Ordering::SeqCst);
    let outcome = node.rebalancer.rebalance_once(STREAM).await.unwrap();
    assert_eq!(outcome.acquired.len(), 2);

    node.stop().await;
}
