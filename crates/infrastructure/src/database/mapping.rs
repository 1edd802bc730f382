//! 数据库行与任务实体之间的映射工具

use chrono::{DateTime, Utc};
use sqlx::Row;
use taskq_core::{QueueError, QueueResult, Task};

/// 任务表的完整列清单
pub(crate) const TASK_COLUMNS: &str = "id, queue_id, task_type, payload, status, execute_at, \
     expires_at, created_at, updated_at, processing_started_at, retries, execution_stats, \
     retry_after, task_group, task_hash, force_store, execution_result";

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis()
    }

    pub fn from_millis(ms: i64) -> QueueResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| QueueError::Storage(format!("无效的时间戳: {ms}")))
    }

    fn optional_millis(row: &sqlx::sqlite::SqliteRow, field: &str) -> QueueResult<Option<DateTime<Utc>>> {
        row.try_get::<Option<i64>, _>(field)?
            .map(Self::from_millis)
            .transpose()
    }

    pub fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> QueueResult<Task> {
        let payload: String = row.try_get("payload")?;
        let stats: String = row.try_get("execution_stats")?;
        let result: Option<String> = row.try_get("execution_result")?;

        Ok(Task {
            id: Some(row.try_get("id")?),
            task_type: row.try_get("task_type")?,
            payload: serde_json::from_str(&payload)?,
            queue_id: row.try_get("queue_id")?,
            status: row.try_get("status")?,
            execute_at: Self::from_millis(row.try_get("execute_at")?)?,
            expires_at: Self::optional_millis(row, "expires_at")?,
            created_at: Self::from_millis(row.try_get("created_at")?)?,
            updated_at: Self::from_millis(row.try_get("updated_at")?)?,
            processing_started_at: Self::optional_millis(row, "processing_started_at")?,
            retries: row.try_get::<i64, _>("retries")?.max(0) as u32,
            execution_stats: serde_json::from_str(&stats)?,
            retry_after_ms: row.try_get::<i64, _>("retry_after")?.max(0) as u64,
            task_group: row.try_get("task_group")?,
            task_hash: row.try_get("task_hash")?,
            force_store: row.try_get("force_store")?,
            execution_result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        })
    }
}
