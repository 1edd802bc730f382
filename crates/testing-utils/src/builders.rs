//! Test data builders for creating test entities
//!
//! Builders start from sensible defaults so a test only spells out the
//! fields it actually cares about.

use chrono::{DateTime, Duration, Utc};
use taskq_core::{StreamRecord, Task, TaskStatus};

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(queue_id: &str, task_type: &str) -> Self {
        Self {
            task: Task::new(queue_id, task_type, serde_json::json!({}), Utc::now()),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = Some(id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn execute_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.execute_at = at;
        self
    }

    /// execute_at = now + offset
    pub fn due_in(mut self, offset: Duration) -> Self {
        self.task.execute_at = Utc::now() + offset;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.expires_at = Some(at);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    /// Sets both retry counters
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.task.retries = retries;
        self.task.execution_stats.retry_count = retries;
        self
    }

    pub fn retry_after_ms(mut self, ms: u64) -> Self {
        self.task.retry_after_ms = ms;
        self
    }

    pub fn with_hash(mut self, hash: &str) -> Self {
        self.task.task_hash = Some(hash.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.task.task_group = Some(group.to_string());
        self
    }

    pub fn force_store(mut self) -> Self {
        self.task.force_store = true;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        self.task.updated_at = at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Encodes a task as a stream record the shard consumer can decode
pub fn task_record(sequence_number: &str, task: &Task) -> StreamRecord {
    StreamRecord {
        sequence_number: sequence_number.to_string(),
        partition_key: Some(task.queue_id.clone()),
        data: serde_json::to_vec(task).unwrap_or_default(),
        arrived_at: Utc::now(),
    }
}

/// A record whose payload is not a task
pub fn garbage_record(sequence_number: &str) -> StreamRecord {
    StreamRecord {
        sequence_number: sequence_number.to_string(),
        partition_key: None,
        data: b"not a task".to_vec(),
        arrived_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let task = TaskBuilder::new("emails", "send").build();
        assert_eq!(task.queue_id, "emails");
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert!(task.id.is_none());
    }

    #[test]
    fn test_task_record_roundtrip() {
        let task = TaskBuilder::new("emails", "send").with_id("t1").build();
        let record = task_record("0001", &task);
        let decoded: Task = serde_json::from_slice(&record.data).unwrap();
        assert_eq!(decoded.id.as_deref(), Some("t1"));
    }
}
