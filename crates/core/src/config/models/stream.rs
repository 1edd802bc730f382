use std::time::Duration;

use serde::{Deserialize, Serialize};

/// AIMD 自适应策略参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub default_batch_size: usize,
    /// 加性增长步长
    pub add_step: usize,
    /// 乘性下降因子
    pub decrease_factor: f64,
    /// 连续成功多少次后增长一次
    pub successes_before_increase: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub delay_multiplier: f64,
    /// 连续失败达到该次数后进入退避
    pub backoff_threshold: u32,
    pub max_backoff_ms: u64,
    pub rolling_window_size: usize,
    /// 失败率超过该值的任务类型视为热点
    pub hot_failure_rate: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 500,
            default_batch_size: 50,
            add_step: 10,
            decrease_factor: 0.5,
            successes_before_increase: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            delay_multiplier: 1.5,
            backoff_threshold: 3,
            max_backoff_ms: 60_000,
            rolling_window_size: 100,
            hot_failure_rate: 0.5,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(anyhow::anyhow!(
                "批次范围无效: [{}, {}]",
                self.min_batch_size,
                self.max_batch_size
            ));
        }
        if !(self.min_batch_size..=self.max_batch_size).contains(&self.default_batch_size) {
            return Err(anyhow::anyhow!(
                "默认批次大小 {} 不在范围内",
                self.default_batch_size
            ));
        }
        if !(0.0 < self.decrease_factor && self.decrease_factor < 1.0) {
            return Err(anyhow::anyhow!("下降因子必须在(0, 1)之间"));
        }
        if self.successes_before_increase == 0 {
            return Err(anyhow::anyhow!("增长所需成功次数必须大于0"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(anyhow::anyhow!("基础延迟不能大于最大延迟"));
        }
        if self.delay_multiplier < 1.0 {
            return Err(anyhow::anyhow!("延迟倍数不能小于1"));
        }
        if self.backoff_threshold == 0 {
            return Err(anyhow::anyhow!("退避阈值必须大于0"));
        }
        if self.rolling_window_size == 0 {
            return Err(anyhow::anyhow!("滚动窗口大小必须大于0"));
        }
        Ok(())
    }
}

/// 分片再均衡与分片消费配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalancerConfig {
    pub enabled: bool,
    /// 需要消费的流
    pub streams: Vec<String>,
    pub interval_ms: u64,
    /// 分片租约TTL，消费过程中持续续期
    pub lease_ttl_secs: u64,
    /// 实例心跳TTL
    pub heartbeat_ttl_secs: u64,
    /// 退避期间的检查间隔
    pub backoff_poll_ms: u64,
    /// 分片无新记录时的等待间隔
    pub idle_poll_ms: u64,
    /// 连续拉取失败超过该次数后放弃该分片
    pub max_fetch_errors: u32,
    /// 停止消费者时等待在途批次完成的时长
    pub stop_timeout_ms: u64,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            streams: Vec::new(),
            interval_ms: 30_000,
            lease_ttl_secs: 60,
            heartbeat_ttl_secs: 45,
            backoff_poll_ms: 500,
            idle_poll_ms: 1000,
            max_fetch_errors: 5,
            stop_timeout_ms: 10_000,
        }
    }
}

impl RebalancerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.streams.is_empty() {
            return Err(anyhow::anyhow!("启用分片再均衡时必须配置至少一个流"));
        }
        if self.interval_ms == 0 {
            return Err(anyhow::anyhow!("再均衡间隔必须大于0"));
        }
        if self.lease_ttl_secs == 0 || self.heartbeat_ttl_secs == 0 {
            return Err(anyhow::anyhow!("租约与心跳TTL必须大于0"));
        }
        if self.heartbeat_ttl_secs * 1000 < self.interval_ms {
            return Err(anyhow::anyhow!(
                "心跳TTL({}s)必须不小于再均衡间隔({}ms)",
                self.heartbeat_ttl_secs,
                self.interval_ms
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn backoff_poll(&self) -> Duration {
        Duration::from_millis(self.backoff_poll_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
