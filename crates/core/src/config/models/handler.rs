use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 任务调度主循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// 到期任务提升周期
    pub mature_poll_interval_ms: u64,
    /// task_processor 全局锁的TTL
    pub task_processor_lock_ttl_secs: u64,
    /// 执行时间在该窗口内的任务直接进入活跃队列
    pub immediate_window_secs: i64,
    /// 执行器未指定时的最大重试次数
    pub default_max_retries: u32,
    /// 累计处理量达到该值时上报统计
    pub stats_volume_threshold: u64,
    /// 累计失败数达到该值时上报统计
    pub stats_failure_threshold: u64,
    /// 异步任务管理器满载时的重新入队延迟
    pub async_requeue_delay_ms: u64,
    pub async_capacity: usize,
    /// 计算丢弃任务24小时总数的采样概率
    pub discard_sample_rate: f64,
    pub cleanup_interval_secs: u64,
    /// processing 超过该时长的任务在清理时删除
    pub orphaned_after_hours: i64,
    /// 已结束任务的保留天数
    pub retention_days: i64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            mature_poll_interval_ms: 5000,
            task_processor_lock_ttl_secs: 60,
            immediate_window_secs: 120,
            default_max_retries: 3,
            stats_volume_threshold: 1000,
            stats_failure_threshold: 100,
            async_requeue_delay_ms: 30_000,
            async_capacity: 256,
            discard_sample_rate: 0.1,
            cleanup_interval_secs: 3600,
            orphaned_after_hours: 72,
            retention_days: 7,
        }
    }
}

impl HandlerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mature_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("到期任务轮询间隔必须大于0"));
        }
        if self.task_processor_lock_ttl_secs == 0 {
            return Err(anyhow::anyhow!("task_processor锁TTL必须大于0"));
        }
        if self.immediate_window_secs < 0 {
            return Err(anyhow::anyhow!("立即执行窗口不能为负数"));
        }
        if self.stats_volume_threshold == 0 || self.stats_failure_threshold == 0 {
            return Err(anyhow::anyhow!("统计上报阈值必须大于0"));
        }
        if self.async_capacity == 0 {
            return Err(anyhow::anyhow!("异步任务容量必须大于0"));
        }
        if !(0.0..=1.0).contains(&self.discard_sample_rate) {
            return Err(anyhow::anyhow!(
                "采样概率必须在0到1之间: {}",
                self.discard_sample_rate
            ));
        }
        if self.orphaned_after_hours <= 0 || self.retention_days <= 0 {
            return Err(anyhow::anyhow!("清理阈值必须大于0"));
        }
        Ok(())
    }

    pub fn mature_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mature_poll_interval_ms)
    }

    pub fn task_processor_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.task_processor_lock_ttl_secs)
    }

    pub fn immediate_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.immediate_window_secs)
    }

    pub fn async_requeue_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.async_requeue_delay_ms as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// 队列轮询消费配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub poll_interval_ms: u64,
    /// queue:{queueId}:{instanceId} 锁的TTL
    pub queue_lock_ttl_secs: u64,
    pub batch_size: usize,
    /// 同时执行处理器的批次上限
    pub worker_pool_size: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            queue_lock_ttl_secs: 60,
            batch_size: 100,
            worker_pool_size: 8,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("队列轮询间隔必须大于0"));
        }
        if self.queue_lock_ttl_secs == 0 {
            return Err(anyhow::anyhow!("队列锁TTL必须大于0"));
        }
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("批次大小必须大于0"));
        }
        if self.worker_pool_size == 0 {
            return Err(anyhow::anyhow!("工作池大小必须大于0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_lock_ttl_secs)
    }
}
