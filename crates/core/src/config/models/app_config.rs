use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    handler::{ConsumerConfig, HandlerConfig},
    instance::InstanceConfig,
    observability::ObservabilityConfig,
    storage::{CacheConfig, StorageConfig},
    stream::{AdaptiveConfig, RebalancerConfig},
};

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub instance: InstanceConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub handler: HandlerConfig,
    pub consumer: ConsumerConfig,
    pub adaptive: AdaptiveConfig,
    pub rebalancer: RebalancerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件与环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 结构体默认值
    /// 2. 配置文件 (TOML)
    /// 3. 环境变量覆盖 (前缀 TASKQ_，层级分隔符 __)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/taskq.toml", "taskq.toml", "/etc/taskq/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKQ")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("instance.enabled_queues")
                .with_list_parse_key("rebalancer.streams")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.instance.validate().context("实例配置验证失败")?;
        self.storage.validate().context("存储配置验证失败")?;
        self.cache.validate().context("缓存配置验证失败")?;
        self.handler.validate().context("任务处理配置验证失败")?;
        self.consumer.validate().context("队列消费配置验证失败")?;
        self.adaptive.validate().context("自适应策略配置验证失败")?;
        self.rebalancer
            .validate()
            .context("分片再均衡配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::storage::{CacheBackend, StorageBackend};
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.adaptive.default_batch_size, 50);
        assert_eq!(config.handler.immediate_window_secs, 120);
        assert_eq!(config.storage.stale_processing_hours, 48);
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [instance]
            id = "node-1"
            enabled_queues = ["emails"]
            queue_suffix = "staging"

            [storage]
            backend = "memory"

            [adaptive]
            max_batch_size = 200
            "#,
        )
        .unwrap();

        assert_eq!(config.instance.id, "node-1");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert_eq!(config.adaptive.max_batch_size, 200);
        assert_eq!(config.adaptive.min_batch_size, 10);
        assert_eq!(config.instance.namespaced_queues(), vec!["emails-staging"]);
    }

    #[test]
    fn test_from_toml_rejects_invalid_adaptive_range() {
        let result = AppConfig::from_toml(
            r#"
            [adaptive]
            min_batch_size = 100
            max_batch_size = 20
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rebalancer_enabled_requires_streams() {
        let mut config = AppConfig::default();
        config.rebalancer.enabled = true;
        assert!(config.validate().is_err());

        config.rebalancer.streams = vec!["events".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [handler]
            mature_poll_interval_ms = 250

            [observability]
            log_format = "json"
            "#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.handler.mature_poll_interval_ms, 250);
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/taskq.toml")).is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = AppConfig::default();
        config.consumer.batch_size = 42;
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.consumer.batch_size, 42);
    }
}
