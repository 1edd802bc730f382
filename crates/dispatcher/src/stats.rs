use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use taskq_core::{CacheProvider, Clock, QueueResult};

/// 单个队列的累计统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub success: u64,
    pub failed: u64,
    pub async_count: u64,
    pub ignored: u64,
}

impl QueueStats {
    /// 已结束的任务数；异步任务完成时计入成功或失败，派发时不计入
    pub fn volume(&self) -> u64 {
        self.success + self.failed + self.ignored
    }

    fn is_empty(&self) -> bool {
        self.volume() == 0 && self.async_count == 0
    }
}

/// 按队列累计统计，达到阈值时上报并清零
pub struct QueueStatsTracker {
    volume_threshold: u64,
    failure_threshold: u64,
    stats: Mutex<HashMap<String, QueueStats>>,
}

impl QueueStatsTracker {
    pub fn new(volume_threshold: u64, failure_threshold: u64) -> Self {
        Self {
            volume_threshold,
            failure_threshold,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// 累加一个批次，越过阈值时返回已上报的统计
    pub fn record(&self, queue_id: &str, delta: QueueStats) -> Option<QueueStats> {
        let flushed = {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            let entry = stats.entry(queue_id.to_string()).or_default();
            entry.success += delta.success;
            entry.failed += delta.failed;
            entry.async_count += delta.async_count;
            entry.ignored += delta.ignored;

            if entry.volume() >= self.volume_threshold || entry.failed >= self.failure_threshold {
                Some(std::mem::take(entry))
            } else {
                None
            }
        };

        if let Some(snapshot) = flushed {
            Self::report(queue_id, &snapshot);
        }
        flushed
    }

    pub fn current(&self, queue_id: &str) -> QueueStats {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.get(queue_id).copied().unwrap_or_default()
    }

    /// 强制上报所有未清零的统计，关闭时调用
    pub fn flush_all(&self) -> HashMap<String, QueueStats> {
        let drained: HashMap<String, QueueStats> = {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.drain().filter(|(_, s)| !s.is_empty()).collect()
        };
        for (queue_id, snapshot) in &drained {
            Self::report(queue_id, snapshot);
        }
        drained
    }

    fn report(queue_id: &str, stats: &QueueStats) {
        info!(
            "队列 {} 统计: 成功 {}, 失败 {}, 异步 {}, 忽略 {}",
            queue_id, stats.success, stats.failed, stats.async_count, stats.ignored
        );
        let queue = queue_id.to_string();
        for (outcome, value) in [
            ("success", stats.success),
            ("failed", stats.failed),
            ("async", stats.async_count),
            ("ignored", stats.ignored),
        ] {
            metrics::counter!("taskq_tasks_total", "queue" => queue.clone(), "outcome" => outcome)
                .increment(value);
        }
    }
}

/// 丢弃计数所用的键前缀
pub const DISCARD_KEY_PREFIX: &str = "task_metrics:discarded:";

const BUCKET_TTL: Duration = Duration::from_secs(25 * 3600);

/// 被丢弃任务的计数
///
/// 按小时分桶保存在共享缓存中，桶保留25小时；24小时总数按采样概率重新计算
/// 并写入 gauge。
pub struct DiscardMetrics {
    cache: Arc<dyn CacheProvider>,
    clock: Arc<dyn Clock>,
    sample_rate: f64,
}

impl DiscardMetrics {
    pub fn new(cache: Arc<dyn CacheProvider>, clock: Arc<dyn Clock>, sample_rate: f64) -> Self {
        Self {
            cache,
            clock,
            sample_rate,
        }
    }

    pub fn bucket_key(at: DateTime<Utc>) -> String {
        format!("{DISCARD_KEY_PREFIX}{}", at.format("%Y%m%d%H"))
    }

    pub async fn record(&self, queue_id: &str, count: u64) -> QueueResult<()> {
        if count == 0 {
            return Ok(());
        }
        warn!("队列 {} 丢弃 {} 个重试耗尽的未持久化任务", queue_id, count);
        metrics::counter!("taskq_tasks_discarded_total", "queue" => queue_id.to_string())
            .increment(count);

        let key = Self::bucket_key(self.clock.now());
        self.cache.incr_by(&key, count as i64).await?;
        self.cache.expire(&key, BUCKET_TTL).await?;

        if rand::random::<f64>() < self.sample_rate {
            let total = self.total_24h().await?;
            debug!("24小时内丢弃任务总数: {}", total);
            metrics::gauge!("taskq_discarded_24h").set(total as f64);
        }
        Ok(())
    }

    /// 最近24个小时桶的总和
    pub async fn total_24h(&self) -> QueueResult<u64> {
        let now = self.clock.now();
        let mut total = 0u64;
        for hours_ago in 0..24 {
            let key = Self::bucket_key(now - ChronoDuration::hours(hours_ago));
            if let Some(value) = self.cache.get(&key).await? {
                total += value.parse::<u64>().unwrap_or(0);
            }
        }
        Ok(total)
    }
}
