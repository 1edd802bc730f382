use serde::{Deserialize, Serialize};

/// 按部署环境给队列名加前后缀，所有队列统一使用
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNamespace {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl QueueNamespace {
    pub fn new(prefix: Option<String>, suffix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
            suffix: suffix.filter(|s| !s.is_empty()),
        }
    }

    /// 已经带有命名空间的队列名保持不变
    pub fn apply(&self, queue_id: &str) -> String {
        if self.is_applied(queue_id) {
            return queue_id.to_string();
        }
        let mut name = String::with_capacity(queue_id.len() + 16);
        if let Some(prefix) = &self.prefix {
            name.push_str(prefix);
            name.push('-');
        }
        name.push_str(queue_id);
        if let Some(suffix) = &self.suffix {
            name.push('-');
            name.push_str(suffix);
        }
        name
    }

    pub fn is_applied(&self, queue_id: &str) -> bool {
        if self.prefix.is_none() && self.suffix.is_none() {
            return true;
        }
        let prefix_ok = self
            .prefix
            .as_ref()
            .map_or(true, |p| queue_id.starts_with(&format!("{p}-")));
        let suffix_ok = self
            .suffix
            .as_ref()
            .map_or(true, |s| queue_id.ends_with(&format!("-{s}")));
        prefix_ok && suffix_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_suffix() {
        let ns = QueueNamespace::new(None, Some("staging".into()));
        assert_eq!(ns.apply("emails"), "emails-staging");
        assert_eq!(ns.apply("emails-staging"), "emails-staging");
    }

    #[test]
    fn test_apply_prefix_and_suffix() {
        let ns = QueueNamespace::new(Some("blog".into()), Some("prod".into()));
        assert_eq!(ns.apply("hooks"), "blog-hooks-prod");
        assert_eq!(ns.apply("blog-hooks-prod"), "blog-hooks-prod");
    }

    #[test]
    fn test_empty_namespace_is_identity() {
        let ns = QueueNamespace::new(Some(String::new()), None);
        assert_eq!(ns.apply("hooks"), "hooks");
    }
}
