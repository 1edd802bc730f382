//! Test doubles for the clock, executors, batch processors and storage
//!
//! All mocks share their state behind `Arc<Mutex<..>>` so a clone kept by
//! the test observes what the component under test did.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use taskq_core::{
    CleanupStats, Clock, ExecutionOutcome, ProcessorOutput, QueueError, QueueResult,
    StorageAdapter, Task, TaskExecutor, TaskProcessor, TaskUpdate,
};

/// A clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// One scripted executor response
#[derive(Debug, Clone)]
pub enum Script {
    Succeed(Option<serde_json::Value>),
    Fail(String),
    Throttle(String),
    Spawn(Vec<Task>),
    Ignore,
    /// Completes asynchronously with the given result
    InFlight(Result<Option<serde_json::Value>, String>),
}

impl Script {
    fn into_outcome(self) -> ExecutionOutcome {
        match self {
            Script::Succeed(result) => ExecutionOutcome::Succeeded(result),
            Script::Fail(error) => ExecutionOutcome::Failed(error),
            Script::Throttle(error) => ExecutionOutcome::Throttled(error),
            Script::Spawn(new_tasks) => ExecutionOutcome::Spawned {
                result: None,
                new_tasks,
            },
            Script::Ignore => ExecutionOutcome::Ignored,
            Script::InFlight(result) => ExecutionOutcome::InFlight(Box::pin(async move {
                result.map_err(QueueError::TaskExecution)
            })),
        }
    }
}

/// Executor that replays a script, then falls back to a default response
#[derive(Clone)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<VecDeque<Script>>>,
    fallback: Script,
    executed: Arc<Mutex<Vec<Task>>>,
}

impl ScriptedExecutor {
    pub fn always(response: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: response,
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::always(Script::Succeed(None))
    }

    pub fn failing(error: &str) -> Self {
        Self::always(Script::Fail(error.to_string()))
    }

    /// Responds with `responses` in order, then with `fallback`
    pub fn sequence(responses: Vec<Script>, fallback: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(responses.into())),
            fallback,
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn executed(&self) -> Vec<Task> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        self.executed.lock().unwrap().push(task.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone()).into_outcome()
    }
}

/// Batch processor that records every batch it receives
///
/// Tasks whose type is in `failing_types` are reported as failed, the rest
/// succeed. `throttle_next(n)` makes the next n calls fail with
/// `QueueError::Throttled`.
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    batches: Arc<Mutex<Vec<(String, Vec<Task>)>>>,
    failing_types: Arc<Mutex<HashSet<String>>>,
    throttled_calls: Arc<Mutex<usize>>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_types(self, types: &[&str]) -> Self {
        {
            let mut failing = self.failing_types.lock().unwrap();
            failing.extend(types.iter().map(|t| t.to_string()));
        }
        self
    }

    pub fn throttle_next(&self, calls: usize) {
        *self.throttled_calls.lock().unwrap() = calls;
    }

    pub fn batches(&self) -> Vec<(String, Vec<Task>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn processed_tasks(&self) -> Vec<Task> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, tasks)| tasks.iter().cloned())
            .collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tasks)| tasks.len())
            .collect()
    }
}

#[async_trait]
impl TaskProcessor for RecordingProcessor {
    async fn process(
        &self,
        consumer_label: &str,
        tasks: Vec<Task>,
    ) -> QueueResult<ProcessorOutput> {
        {
            let mut throttled = self.throttled_calls.lock().unwrap();
            if *throttled > 0 {
                *throttled -= 1;
                return Err(QueueError::Throttled(format!(
                    "{consumer_label}: downstream throttled"
                )));
            }
        }

        self.batches
            .lock()
            .unwrap()
            .push((consumer_label.to_string(), tasks.clone()));

        let failing = self.failing_types.lock().unwrap().clone();
        let mut output = ProcessorOutput::default();
        for mut task in tasks {
            if failing.contains(&task.task_type) {
                task.execution_stats.last_error = Some("scripted failure".to_string());
                output.failed_tasks.push(task);
            } else {
                output.success_tasks.push(task);
            }
        }
        Ok(output)
    }
}

/// Storage wrapper whose writes can be switched to fail
///
/// Reads always go through to the wrapped adapter.
#[derive(Clone)]
pub struct FailingStorage {
    inner: Arc<dyn StorageAdapter>,
    failing: Arc<AtomicBool>,
}

impl FailingStorage {
    pub fn new(inner: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> QueueResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for FailingStorage {
    async fn add_tasks_to_scheduled(&self, tasks: &[Task]) -> QueueResult<Vec<Task>> {
        self.check()?;
        self.inner.add_tasks_to_scheduled(tasks).await
    }

    async fn get_mature_tasks(&self, now: DateTime<Utc>) -> QueueResult<Vec<Task>> {
        self.check()?;
        self.inner.get_mature_tasks(now).await
    }

    async fn mark_tasks_as_processing(
        &self,
        tasks: &[Task],
        started_at: DateTime<Utc>,
    ) -> QueueResult<u64> {
        self.check()?;
        self.inner.mark_tasks_as_processing(tasks, started_at).await
    }

    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.check()?;
        self.inner.mark_tasks_as_executed(tasks).await
    }

    async fn mark_tasks_as_failed(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.check()?;
        self.inner.mark_tasks_as_failed(tasks).await
    }

    async fn mark_tasks_as_ignored(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.check()?;
        self.inner.mark_tasks_as_ignored(tasks).await
    }

    async fn mark_tasks_as_expired(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.check()?;
        self.inner.mark_tasks_as_expired(tasks).await
    }

    async fn update_tasks(&self, updates: &[TaskUpdate]) -> QueueResult<Vec<String>> {
        self.check()?;
        self.inner.update_tasks(updates).await
    }

    async fn upsert_tasks(&self, tasks: &[Task]) -> QueueResult<Vec<Task>> {
        self.check()?;
        self.inner.upsert_tasks(tasks).await
    }

    async fn get_tasks_by_ids(&self, ids: &[String]) -> QueueResult<Vec<Task>> {
        self.inner.get_tasks_by_ids(ids).await
    }

    async fn get_cleanup_stats(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        self.inner
            .get_cleanup_stats(orphaned_before, expired_before)
            .await
    }

    async fn cleanup_tasks(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        self.check()?;
        self.inner.cleanup_tasks(orphaned_before, expired_before).await
    }

    fn generate_id(&self) -> String {
        self.inner.generate_id()
    }
}
