pub mod app_config;
pub mod handler;
pub mod instance;
pub mod observability;
pub mod storage;
pub mod stream;

pub use app_config::AppConfig;
pub use handler::{ConsumerConfig, HandlerConfig};
pub use instance::InstanceConfig;
pub use observability::ObservabilityConfig;
pub use storage::{CacheBackend, CacheConfig, StorageBackend, StorageConfig};
pub use stream::{AdaptiveConfig, RebalancerConfig};
