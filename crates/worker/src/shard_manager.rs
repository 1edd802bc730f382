use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use taskq_core::{PartitionedStream, QueueResult};

/// 一次分配计算的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardAssignment {
    /// 本实例应持有的分片
    pub target_shards: BTreeSet<String>,
    /// 当前持有但应交出的分片
    pub shards_to_release: BTreeSet<String>,
}

/// 分片发现与确定性分配
pub struct ShardManager {
    stream: Arc<dyn PartitionedStream>,
    instance_id: String,
}

impl ShardManager {
    pub fn new(stream: Arc<dyn PartitionedStream>, instance_id: impl Into<String>) -> Self {
        Self {
            stream,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn list_shards(&self, stream_id: &str) -> QueueResult<Vec<String>> {
        self.stream.list_shards(stream_id).await
    }

    pub fn calculate_shard_assignment(
        &self,
        available_shards: &[String],
        active_instances: &[String],
        currently_held: &BTreeSet<String>,
    ) -> ShardAssignment {
        assign_shards(
            &self.instance_id,
            available_shards,
            active_instances,
            currently_held,
        )
    }
}

/// 纯函数：排序后第 i 个分片分配给第 i % n 个实例
///
/// 所有实例在看到相同的分片与实例列表时得到相同的全局分配。本实例不在
/// 存活列表中时不分配任何分片。
pub fn assign_shards(
    instance_id: &str,
    available_shards: &[String],
    active_instances: &[String],
    currently_held: &BTreeSet<String>,
) -> ShardAssignment {
    let shards: BTreeSet<&String> = available_shards.iter().collect();
    let instances: BTreeSet<&String> = active_instances.iter().collect();
    let instances: Vec<&String> = instances.into_iter().collect();

    let target_shards: BTreeSet<String> = match instances.iter().position(|i| *i == instance_id) {
        Some(own_index) => shards
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % instances.len() == own_index)
            .map(|(_, shard)| shard.clone())
            .collect(),
        None => BTreeSet::new(),
    };

    let shards_to_release = currently_held
        .difference(&target_shards)
        .cloned()
        .collect();

    debug!(
        "实例 {} 的目标分片: {:?}, 待释放: {:?}",
        instance_id, target_shards, shards_to_release
    );
    ShardAssignment {
        target_shards,
        shards_to_release,
    }
}
