pub mod adaptive;
pub mod components;
pub mod shard_manager;

pub use adaptive::{AggregateSnapshot, AdaptiveStrategy, ShardSnapshot, StrategySnapshot};
pub use components::*;
pub use shard_manager::{assign_shards, ShardAssignment, ShardManager};
