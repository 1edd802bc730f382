use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use taskq_core::{PartitionedStream, QueueError, QueueResult, RecordBatch, StreamRecord, Task};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct ShardLog {
    records: Vec<StreamRecord>,
    closed: bool,
    next_sequence: u64,
    pending_errors: VecDeque<QueueError>,
}

/// 内存分区流，序列号为定长数字字符串，按字典序即按写入顺序
#[derive(Debug, Clone, Default)]
pub struct InMemoryPartitionedStream {
    streams: Arc<RwLock<HashMap<String, BTreeMap<String, ShardLog>>>>,
}

impl InMemoryPartitionedStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard_name(index: usize) -> String {
        format!("shardId-{index:012}")
    }

    /// 创建带 shard_count 个分片的流，返回分片id
    pub async fn create_stream(&self, stream_id: &str, shard_count: usize) -> Vec<String> {
        let mut streams = self.streams.write().await;
        let shards = streams.entry(stream_id.to_string()).or_default();
        for index in 0..shard_count {
            shards.entry(Self::shard_name(index)).or_default();
        }
        shards.keys().cloned().collect()
    }

    pub async fn put_record(
        &self,
        stream_id: &str,
        shard_id: &str,
        data: Vec<u8>,
    ) -> QueueResult<String> {
        let mut streams = self.streams.write().await;
        let shard = streams
            .get_mut(stream_id)
            .and_then(|shards| shards.get_mut(shard_id))
            .ok_or_else(|| QueueError::Stream(format!("未知的分片 {stream_id}/{shard_id}")))?;
        if shard.closed {
            return Err(QueueError::ShardClosed {
                stream: stream_id.to_string(),
                shard: shard_id.to_string(),
            });
        }

        shard.next_sequence += 1;
        let sequence_number = format!("{:020}", shard.next_sequence);
        shard.records.push(StreamRecord {
            sequence_number: sequence_number.clone(),
            partition_key: None,
            data,
            arrived_at: Utc::now(),
        });
        Ok(sequence_number)
    }

    pub async fn put_task(&self, stream_id: &str, shard_id: &str, task: &Task) -> QueueResult<String> {
        let data = serde_json::to_vec(task)?;
        self.put_record(stream_id, shard_id, data).await
    }

    /// 关闭分片，读完剩余记录后 shard_closed 为 true
    pub async fn close_shard(&self, stream_id: &str, shard_id: &str) {
        let mut streams = self.streams.write().await;
        if let Some(shard) = streams
            .get_mut(stream_id)
            .and_then(|shards| shards.get_mut(shard_id))
        {
            shard.closed = true;
        }
    }

    /// 让下一次拉取返回指定错误
    pub async fn fail_next_fetch(&self, stream_id: &str, shard_id: &str, error: QueueError) {
        let mut streams = self.streams.write().await;
        if let Some(shard) = streams
            .get_mut(stream_id)
            .and_then(|shards| shards.get_mut(shard_id))
        {
            shard.pending_errors.push_back(error);
        }
    }
}

#[async_trait]
impl PartitionedStream for InMemoryPartitionedStream {
    async fn list_shards(&self, stream_id: &str) -> QueueResult<Vec<String>> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .map(|shards| shards.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_records(
        &self,
        stream_id: &str,
        shard_id: &str,
        after_sequence: Option<&str>,
        limit: usize,
    ) -> QueueResult<RecordBatch> {
        let mut streams = self.streams.write().await;
        let shard = streams
            .get_mut(stream_id)
            .and_then(|shards| shards.get_mut(shard_id))
            .ok_or_else(|| QueueError::Stream(format!("未知的分片 {stream_id}/{shard_id}")))?;

        if let Some(error) = shard.pending_errors.pop_front() {
            return Err(error);
        }

        let remaining: Vec<&StreamRecord> = shard
            .records
            .iter()
            .filter(|r| after_sequence.map_or(true, |after| r.sequence_number.as_str() > after))
            .collect();
        let exhausted = remaining.len() <= limit;
        let records = remaining.into_iter().take(limit).cloned().collect();

        Ok(RecordBatch {
            records,
            shard_closed: shard.closed && exhausted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_after_checkpoint() {
        let stream = InMemoryPartitionedStream::new();
        let shards = stream.create_stream("events", 2).await;
        assert_eq!(shards.len(), 2);

        let first = stream.put_record("events", &shards[0], b"a".to_vec()).await.unwrap();
        stream.put_record("events", &shards[0], b"b".to_vec()).await.unwrap();
        stream.put_record("events", &shards[0], b"c".to_vec()).await.unwrap();

        let batch = stream
            .get_records("events", &shards[0], Some(&first), 1)
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].data, b"b".to_vec());
        assert!(!batch.shard_closed);
    }

    #[tokio::test]
    async fn test_closed_shard_reports_after_drain() {
        let stream = InMemoryPartitionedStream::new();
        let shards = stream.create_stream("events", 1).await;
        stream.put_record("events", &shards[0], b"a".to_vec()).await.unwrap();
        stream.close_shard("events", &shards[0]).await;

        let batch = stream.get_records("events", &shards[0], None, 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert!(batch.shard_closed);
        assert!(stream.put_record("events", &shards[0], b"b".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_is_returned_once() {
        let stream = InMemoryPartitionedStream::new();
        let shards = stream.create_stream("events", 1).await;
        stream
            .fail_next_fetch("events", &shards[0], QueueError::Stream("throttled".into()))
            .await;

        assert!(stream.get_records("events", &shards[0], None, 10).await.is_err());
        assert!(stream.get_records("events", &shards[0], None, 10).await.is_ok());
    }
}
