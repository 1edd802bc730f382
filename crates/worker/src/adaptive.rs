//! AIMD 自适应批次与退避控制
//!
//! 每个分片独立维护批次大小、拉取间隔与退避状态：连续成功时加性增长批次，
//! 任一失败信号（失败、限流、毒丸）时乘性缩小批次并拉长间隔，连续失败
//! 达到阈值后进入指数退避。滚动窗口按任务类型记录结果，用于识别失败率
//! 过高的热点类型。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use taskq_core::config::AdaptiveConfig;
use taskq_core::{BatchResult, Clock};

#[derive(Debug, Clone)]
struct TypeOutcome {
    task_type: String,
    failed: bool,
}

#[derive(Debug, Clone)]
struct ShardState {
    batch_size: usize,
    delay_ms: u64,
    consecutive_successes: u32,
    consecutive_failures: u32,
    backoff_until: Option<DateTime<Utc>>,
    window: VecDeque<TypeOutcome>,
}

impl ShardState {
    fn new(config: &AdaptiveConfig) -> Self {
        Self {
            batch_size: config.default_batch_size,
            delay_ms: config.base_delay_ms,
            consecutive_successes: 0,
            consecutive_failures: 0,
            backoff_until: None,
            window: VecDeque::with_capacity(config.rolling_window_size),
        }
    }

    fn hot_task_types(&self, threshold: f64) -> Vec<String> {
        let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for outcome in &self.window {
            let entry = counts.entry(outcome.task_type.as_str()).or_default();
            entry.0 += 1;
            if outcome.failed {
                entry.1 += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, (total, failed))| *failed as f64 / *total as f64 > threshold)
            .map(|(task_type, _)| task_type.to_string())
            .collect()
    }
}

/// 单个分片的状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardSnapshot {
    pub stream_id: String,
    pub shard_id: String,
    pub batch_size: usize,
    pub delay_ms: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub hot_task_types: Vec<String>,
}

/// 所有分片的汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub shard_count: usize,
    pub avg_batch_size: f64,
    pub avg_delay_ms: f64,
    pub shards_in_backoff: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StrategySnapshot {
    Shard(ShardSnapshot),
    Aggregate(AggregateSnapshot),
}

/// 分片 id 只在流内唯一，状态按 (stream, shard) 区分
type ShardKey = (String, String);

fn shard_key(stream_id: &str, shard_id: &str) -> ShardKey {
    (stream_id.to_string(), shard_id.to_string())
}

pub struct AdaptiveStrategy {
    config: AdaptiveConfig,
    clock: Arc<dyn Clock>,
    shards: Mutex<HashMap<ShardKey, ShardState>>,
}

impl AdaptiveStrategy {
    pub fn new(config: AdaptiveConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            shards: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    fn shards(&self) -> std::sync::MutexGuard<'_, HashMap<ShardKey, ShardState>> {
        self.shards.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_state<T>(
        &self,
        stream_id: &str,
        shard_id: &str,
        f: impl FnOnce(&ShardState) -> T,
    ) -> Option<T> {
        self.shards().get(&shard_key(stream_id, shard_id)).map(f)
    }

    pub fn record_batch_result(&self, result: &BatchResult) {
        let now = self.clock.now();
        let config = &self.config;
        let label = format!("{}/{}", result.stream_id, result.shard_id);
        let mut shards = self.shards();
        let state = shards
            .entry(shard_key(&result.stream_id, &result.shard_id))
            .or_insert_with(|| ShardState::new(config));

        if result.is_failure() {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.consecutive_successes = 0;
            state.delay_ms =
                ((state.delay_ms as f64 * config.delay_multiplier) as u64).min(config.max_delay_ms);
            state.batch_size = ((state.batch_size as f64 * config.decrease_factor).floor()
                as usize)
                .max(config.min_batch_size);

            if state.consecutive_failures >= config.backoff_threshold {
                let exponent = state.consecutive_failures - config.backoff_threshold;
                let backoff_ms = 1u64
                    .checked_shl(exponent)
                    .unwrap_or(u64::MAX)
                    .saturating_mul(1000)
                    .min(config.max_backoff_ms);
                state.backoff_until = Some(now + ChronoDuration::milliseconds(backoff_ms as i64));
                warn!(
                    "分片 {} 连续失败 {} 次，退避 {}ms",
                    label, state.consecutive_failures, backoff_ms
                );
                metrics::counter!(
                    "taskq_shard_backoff_total",
                    "stream" => result.stream_id.clone(),
                    "shard" => result.shard_id.clone()
                )
                .increment(1);
            }
            debug!(
                "分片 {} 批次失败 (throttled={}, poison={})，批次缩小到 {}",
                label, result.throttled, result.poison_pill, state.batch_size
            );
        } else {
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            state.consecutive_failures = 0;
            state.delay_ms = config.base_delay_ms;
            if state.backoff_until.take().is_some() {
                info!("分片 {} 恢复正常，解除退避", label);
            }
            // 配置未经校验时 0 按每次成功都增长处理
            if state.consecutive_successes % config.successes_before_increase.max(1) == 0 {
                state.batch_size = (state.batch_size + config.add_step).min(config.max_batch_size);
            }
        }

        for task_type in &result.task_types {
            state.window.push_back(TypeOutcome {
                task_type: task_type.clone(),
                failed: result.failed_task_types.contains(task_type),
            });
        }
        while state.window.len() > config.rolling_window_size {
            state.window.pop_front();
        }

        metrics::gauge!(
            "taskq_shard_batch_size",
            "stream" => result.stream_id.clone(),
            "shard" => result.shard_id.clone()
        )
        .set(state.batch_size as f64);
    }

    pub fn get_batch_size(&self, stream_id: &str, shard_id: &str) -> usize {
        self.with_state(stream_id, shard_id, |s| s.batch_size)
            .unwrap_or(self.config.default_batch_size)
    }

    pub fn get_processing_delay(&self, stream_id: &str, shard_id: &str) -> Duration {
        let delay_ms = self
            .with_state(stream_id, shard_id, |s| s.delay_ms)
            .unwrap_or(self.config.base_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// backoff_until 在未来时返回 true
    pub fn should_backoff(&self, stream_id: &str, shard_id: &str) -> bool {
        self.backoff_remaining(stream_id, shard_id).is_some()
    }

    pub fn backoff_remaining(&self, stream_id: &str, shard_id: &str) -> Option<Duration> {
        let now = self.clock.now();
        let until = self.with_state(stream_id, shard_id, |s| s.backoff_until)??;
        (until > now).then(|| (until - now).to_std().unwrap_or_default())
    }

    /// 滚动窗口内失败率超过阈值的任务类型
    pub fn hot_task_types(&self, stream_id: &str, shard_id: &str) -> Vec<String> {
        self.with_state(stream_id, shard_id, |s| {
            s.hot_task_types(self.config.hot_failure_rate)
        })
        .unwrap_or_default()
    }

    /// 分片交出后丢弃其状态
    pub fn remove_shard(&self, stream_id: &str, shard_id: &str) {
        self.shards().remove(&shard_key(stream_id, shard_id));
    }

    /// 指定 (stream, shard) 时返回单个分片状态，否则返回所有流的汇总
    pub fn get_snapshot(&self, shard: Option<(&str, &str)>) -> StrategySnapshot {
        let shards = self.shards();
        match shard {
            Some((stream_id, shard_id)) => {
                let default_state = ShardState::new(&self.config);
                let state = shards
                    .get(&shard_key(stream_id, shard_id))
                    .unwrap_or(&default_state);
                StrategySnapshot::Shard(ShardSnapshot {
                    stream_id: stream_id.to_string(),
                    shard_id: shard_id.to_string(),
                    batch_size: state.batch_size,
                    delay_ms: state.delay_ms,
                    consecutive_successes: state.consecutive_successes,
                    consecutive_failures: state.consecutive_failures,
                    backoff_until: state.backoff_until,
                    hot_task_types: state.hot_task_types(self.config.hot_failure_rate),
                })
            }
            None if shards.is_empty() => StrategySnapshot::Aggregate(AggregateSnapshot {
                shard_count: 0,
                avg_batch_size: self.config.default_batch_size as f64,
                avg_delay_ms: self.config.base_delay_ms as f64,
                shards_in_backoff: 0,
            }),
            None => {
                let now = self.clock.now();
                let count = shards.len() as f64;
                StrategySnapshot::Aggregate(AggregateSnapshot {
                    shard_count: shards.len(),
                    avg_batch_size: shards.values().map(|s| s.batch_size as f64).sum::<f64>()
                        / count,
                    avg_delay_ms: shards.values().map(|s| s.delay_ms as f64).sum::<f64>() / count,
                    shards_in_backoff: shards
                        .values()
                        .filter(|s| s.backoff_until.is_some_and(|until| until > now))
                        .count(),
                })
            }
        }
    }
}
