pub mod lifecycle_hook;
pub mod queue_consumer;
pub mod shard_consumer;
pub mod shard_rebalancer;
pub mod worker_pool;

pub use lifecycle_hook::{fire_hook, HookEvent, NoopLifecycleHook, ShardLifecycleHook};
pub use queue_consumer::QueueConsumer;
pub use shard_consumer::{
    checkpoint_key, ConsumerContext, ConsumerState, ShardConsumer, ShardConsumerHandle,
    ShardRegistry, CHECKPOINT_PREFIX,
};
pub use shard_rebalancer::{RebalanceOutcome, ShardRebalancer};
pub use worker_pool::WorkerPool;
