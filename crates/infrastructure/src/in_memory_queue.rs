use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskq_core::{ActiveQueue, QueueResult, Task};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct DelayQueue {
    /// (execute_at, 入队序号) -> 任务
    entries: BTreeMap<(DateTime<Utc>, u64), Task>,
    ids: HashSet<String>,
}

/// 内存活跃队列
///
/// 每个队列是一个按 execute_at 排序的延迟队列，只有到期的任务会被取出。
/// 带id的任务在仍处于队列中时重复入队会被忽略。
#[derive(Debug, Clone, Default)]
pub struct InMemoryActiveQueue {
    queues: Arc<Mutex<HashMap<String, DelayQueue>>>,
    sequence: Arc<std::sync::atomic::AtomicU64>,
}

impl InMemoryActiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列中所有任务（含未到期），按 execute_at 排序
    pub async fn snapshot(&self, queue_id: &str) -> Vec<Task> {
        let queues = self.queues.lock().await;
        queues
            .get(queue_id)
            .map(|q| q.entries.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActiveQueue for InMemoryActiveQueue {
    async fn enqueue(&self, queue_id: &str, tasks: Vec<Task>) -> QueueResult<usize> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(queue_id.to_string()).or_default();

        let mut accepted = 0;
        for task in tasks {
            if let Some(id) = &task.id {
                if !queue.ids.insert(id.clone()) {
                    debug!("任务 {} 已在队列 {} 中，忽略", id, queue_id);
                    continue;
                }
            }
            let seq = self
                .sequence
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            queue.entries.insert((task.execute_at, seq), task);
            accepted += 1;
        }
        Ok(accepted)
    }

    async fn dequeue_batch(
        &self,
        queue_id: &str,
        max: usize,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<Task>> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(queue_id) else {
            return Ok(Vec::new());
        };

        let due: Vec<(DateTime<Utc>, u64)> = queue
            .entries
            .iter()
            .take_while(|((execute_at, _), _)| *execute_at <= now)
            .take(max)
            .map(|(key, _)| *key)
            .collect();

        let mut tasks = Vec::with_capacity(due.len());
        for key in due {
            if let Some(task) = queue.entries.remove(&key) {
                if let Some(id) = &task.id {
                    queue.ids.remove(id);
                }
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn len(&self, queue_id: &str) -> QueueResult<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue_id).map_or(0, |q| q.entries.len()))
    }
}
