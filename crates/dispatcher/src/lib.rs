//! 任务调度层
//!
//! 执行器注册表、重试策略、异步任务管理以及串联它们的 TaskHandler。

pub mod async_manager;
pub mod executor_registry;
pub mod retry_service;
pub mod stats;
pub mod task_handler;

pub use async_manager::{AsyncCompletion, BoundedAsyncTaskManager};
pub use executor_registry::{ExecutorDescriptor, ExecutorRegistry, RegistryProcessor};
pub use retry_service::{RetryConfig, RetryDecision, RetryPolicy};
pub use stats::{DiscardMetrics, QueueStats, QueueStatsTracker, DISCARD_KEY_PREFIX};
pub use task_handler::{AddTasksOutcome, TaskHandler, TASK_CLEANUP_LOCK, TASK_PROCESSOR_LOCK};
