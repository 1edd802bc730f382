use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// sqlx 关系型存储
    Sqlite,
    /// 内存文档存储（嵌入式与测试）
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub max_connections: u32,
    /// processing 状态超过该时长视为卡死，重新调度
    pub stale_processing_hours: i64,
    /// 单次认领的最大任务数
    pub mature_page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            url: "sqlite://taskq.db?mode=rwc".to_string(),
            max_connections: 5,
            stale_processing_hours: 48,
            mature_page_size: 1000,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == StorageBackend::Sqlite && self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        if self.stale_processing_hours <= 0 {
            return Err(anyhow::anyhow!("卡死判定时长必须大于0"));
        }
        if self.mature_page_size == 0 {
            return Err(anyhow::anyhow!("认领页大小必须大于0"));
        }
        Ok(())
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_processing_hours)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: String,
    /// 所有键的公共前缀
    pub key_prefix: Option<String>,
    pub command_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: Some("taskq".to_string()),
            command_timeout_ms: 3000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == CacheBackend::Redis
            && !self.redis_url.starts_with("redis://")
            && !self.redis_url.starts_with("rediss://")
        {
            return Err(anyhow::anyhow!(
                "Redis URL必须以redis://或rediss://开头: {}",
                self.redis_url
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
