use thiserror::Error;

/// 任务队列错误类型定义
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储操作错误: {0}")]
    Storage(String),

    #[error("缓存错误: {0}")]
    Cache(String),

    #[error("锁不可用: {0}")]
    LockUnavailable(String),

    #[error("分片流错误: {0}")]
    Stream(String),

    #[error("分片已关闭: {stream}/{shard}")]
    ShardClosed { stream: String, shard: String },

    #[error("请求被限流: {0}")]
    Throttled(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("调用约定错误: {0}")]
    ContractViolation(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl QueueError {
    /// 是否可以在下一个周期重试
    ///
    /// 分片关闭、配置错误和调用约定错误属于不可恢复错误，
    /// 其余基础设施错误都视为暂时性错误。
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            QueueError::ShardClosed { .. }
                | QueueError::Configuration(_)
                | QueueError::ContractViolation(_)
        )
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, QueueError::Throttled(_))
    }
}

/// 统一的Result类型
pub type QueueResult<T> = std::result::Result<T, QueueError>;
