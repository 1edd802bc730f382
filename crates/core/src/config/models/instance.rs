use serde::{Deserialize, Serialize};

use crate::namespace::QueueNamespace;

/// 实例身份与队列选择
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// 实例id，留空时由主机名加随机后缀生成
    pub id: String,
    /// 本实例消费的队列（未加命名空间的原始名称）
    pub enabled_queues: Vec<String>,
    pub queue_prefix: Option<String>,
    pub queue_suffix: Option<String>,
}

impl InstanceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enabled_queues.iter().any(|q| q.trim().is_empty()) {
            return Err(anyhow::anyhow!("队列名称不能为空"));
        }
        if let Some(suffix) = &self.queue_suffix {
            if suffix.contains(':') {
                return Err(anyhow::anyhow!("队列后缀不能包含':': {suffix}"));
            }
        }
        Ok(())
    }

    pub fn namespace(&self) -> QueueNamespace {
        QueueNamespace::new(self.queue_prefix.clone(), self.queue_suffix.clone())
    }

    /// 加上命名空间后的消费队列
    pub fn namespaced_queues(&self) -> Vec<String> {
        let ns = self.namespace();
        self.enabled_queues.iter().map(|q| ns.apply(q)).collect()
    }

    /// 返回配置的实例id，未配置时生成一个
    pub fn resolve_id(&self) -> String {
        if !self.id.trim().is_empty() {
            return self.id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "taskq".to_string());
        format!("{host}-{:04x}", rand::random::<u16>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_id_keeps_configured_value() {
        let config = InstanceConfig {
            id: "instance-a".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve_id(), "instance-a");
    }

    #[test]
    fn test_resolve_id_generates_when_empty() {
        let config = InstanceConfig::default();
        let id = config.resolve_id();
        assert!(!id.is_empty());
        assert!(id.contains('-'));
    }

    #[test]
    fn test_namespaced_queues() {
        let config = InstanceConfig {
            enabled_queues: vec!["emails".into(), "hooks".into()],
            queue_suffix: Some("dev".into()),
            ..Default::default()
        };
        assert_eq!(config.namespaced_queues(), vec!["emails-dev", "hooks-dev"]);
    }
}
