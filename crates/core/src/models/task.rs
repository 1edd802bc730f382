use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 任务默认的重试退避基数（毫秒）
pub const DEFAULT_RETRY_AFTER_MS: u64 = 2000;

/// 单次重试退避的上限（30 天）
pub const MAX_RETRY_DELAY_MS: u64 = 30 * 24 * 3600 * 1000;

/// 任务，队列子系统的核心实体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// 后端相关的标识；未持久化的任务可以没有id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// 选择执行器的任务类型
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub queue_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub execute_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub execution_stats: ExecutionStats,
    /// 重试退避基数（毫秒），实际延迟为 retry_after * (retry_count + 1)^2
    #[serde(default = "default_retry_after_ms", rename = "retry_after")]
    pub retry_after_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_hash: Option<String>,
    /// 即使执行时间临近也强制持久化
    #[serde(default)]
    pub force_store: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<serde_json::Value>,
}

fn default_retry_after_ms() -> u64 {
    DEFAULT_RETRY_AFTER_MS
}

/// 执行统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStats {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        queue_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        execute_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            task_type: task_type.into(),
            payload,
            queue_id: queue_id.into(),
            status: TaskStatus::Scheduled,
            execute_at,
            expires_at: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            retries: 0,
            execution_stats: ExecutionStats::default(),
            retry_after_ms: DEFAULT_RETRY_AFTER_MS,
            task_group: None,
            task_hash: None,
            force_store: false,
            execution_result: None,
        }
    }

    /// 当前已经重试的次数
    pub fn retry_count(&self) -> u32 {
        self.execution_stats.retry_count.max(self.retries)
    }

    /// 第 retry_count 次失败后的退避时长：retry_after * (retry_count + 1)^2，
    /// 不超过 MAX_RETRY_DELAY_MS
    pub fn retry_delay(&self) -> Duration {
        let factor = u64::from(self.retry_count().saturating_add(1)).saturating_pow(2);
        let delay_ms = self
            .retry_after_ms
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY_MS);
        Duration::milliseconds(delay_ms as i64)
    }

    /// 下一次尝试的时间，超出时间范围时取最大可表示时间
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.retry_delay())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_at <= now
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    /// 用于日志的简短描述
    pub fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{}#{}", self.queue_id, self.task_type, id),
            None => format!("{}:{}#<transient>", self.queue_id, self.task_type),
        }
    }
}

/// 任务状态
///
/// 状态只能沿 scheduled -> processing -> {executed, failed, expired, ignored}
/// 前进，唯一例外是超时的 processing 任务会被重置为 scheduled。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Scheduled,
    Processing,
    Executed,
    Failed,
    Expired,
    Ignored,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Processing => "processing",
            TaskStatus::Executed => "executed",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
            TaskStatus::Ignored => "ignored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Executed | TaskStatus::Failed | TaskStatus::Expired | TaskStatus::Ignored
        )
    }

    pub fn terminal_states() -> [TaskStatus; 4] {
        [
            TaskStatus::Executed,
            TaskStatus::Failed,
            TaskStatus::Expired,
            TaskStatus::Ignored,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "processing" => Ok(TaskStatus::Processing),
            "executed" => Ok(TaskStatus::Executed),
            "failed" => Ok(TaskStatus::Failed),
            "expired" => Ok(TaskStatus::Expired),
            "ignored" => Ok(TaskStatus::Ignored),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<TaskStatus>().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 部分字段更新，None 表示保持不变
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub execute_at: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
    pub execution_stats: Option<ExecutionStats>,
    /// Some(None) 表示清空
    pub processing_started_at: Option<Option<DateTime<Utc>>>,
    pub execution_result: Option<serde_json::Value>,
    pub payload: Option<serde_json::Value>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// 将补丁应用到内存中的任务
    pub fn apply_to(&self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(execute_at) = self.execute_at {
            task.execute_at = execute_at;
        }
        if let Some(retries) = self.retries {
            task.retries = retries;
        }
        if let Some(stats) = &self.execution_stats {
            task.execution_stats = stats.clone();
        }
        if let Some(started) = self.processing_started_at {
            task.processing_started_at = started;
        }
        if let Some(result) = &self.execution_result {
            task.execution_result = Some(result.clone());
        }
        if let Some(payload) = &self.payload {
            task.payload = payload.clone();
        }
        task.updated_at = now;
    }
}

/// 按id定位的一次部分更新
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub id: String,
    pub patch: TaskPatch,
}

/// 清理统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// 长时间停留在 processing 的任务数
    pub orphaned: u64,
    /// 已结束且超过保留期的任务数
    pub expired: u64,
}

impl CleanupStats {
    pub fn total(&self) -> u64 {
        self.orphaned + self.expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_formula() {
        let mut task = Task::new("q", "email", serde_json::json!({}), Utc::now());
        task.retry_after_ms = 2000;
        task.execution_stats.retry_count = 2;
        assert_eq!(task.retry_delay(), Duration::milliseconds(18000));

        task.execution_stats.retry_count = 0;
        task.retry_after_ms = 1000;
        assert_eq!(task.retry_delay(), Duration::milliseconds(1000));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let now = Utc::now();
        let mut task = Task::new("q", "email", serde_json::json!({}), now);
        task.retry_after_ms = u64::MAX;
        assert_eq!(
            task.retry_delay(),
            Duration::milliseconds(MAX_RETRY_DELAY_MS as i64)
        );
        assert!(task.next_retry_at(now) > now);

        task.retry_after_ms = 100_000_000_000_000_000;
        task.execution_stats.retry_count = u32::MAX;
        assert_eq!(
            task.next_retry_at(now),
            now + Duration::milliseconds(MAX_RETRY_DELAY_MS as i64)
        );
        assert_eq!(
            task.next_retry_at(DateTime::<Utc>::MAX_UTC),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_retry_count_prefers_larger_counter() {
        let mut task = Task::new("q", "email", serde_json::json!({}), Utc::now());
        task.retries = 2;
        assert_eq!(task.retry_count(), 2);
        task.execution_stats.retry_count = 3;
        assert_eq!(task.retry_count(), 3);
    }

    #[test]
    fn test_status_parse() {
        for status in [
            TaskStatus::Scheduled,
            TaskStatus::Processing,
            TaskStatus::Executed,
            TaskStatus::Failed,
            TaskStatus::Expired,
            TaskStatus::Ignored,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Ignored.is_terminal());
    }

    #[test]
    fn test_deserialize_minimal_task() {
        let raw = r#"{
            "type": "webhook",
            "queue_id": "hooks",
            "execute_at": "2026-01-01T00:00:00Z",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.task_type, "webhook");
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.retry_after_ms, DEFAULT_RETRY_AFTER_MS);
        assert!(task.id.is_none());
    }

    #[test]
    fn test_patch_apply() {
        let now = Utc::now();
        let mut task = Task::new("q", "email", serde_json::json!({}), now);
        task.processing_started_at = Some(now);
        let patch = TaskPatch {
            status: Some(TaskStatus::Scheduled),
            retries: Some(1),
            processing_started_at: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut task, now);
        assert_eq!(task.retries, 1);
        assert!(task.processing_started_at.is_none());
    }
}
