//! Redis 缓存提供者

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use taskq_core::config::CacheConfig;
use taskq_core::{CacheProvider, QueueError, QueueResult};
use tracing::{debug, error, info, instrument};

/// 基于 Redis 连接管理器的缓存提供者，所有键都带有统一前缀
#[derive(Clone)]
pub struct RedisCacheProvider {
    conn: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
}

impl RedisCacheProvider {
    pub async fn new(config: &CacheConfig) -> QueueResult<Self> {
        info!("连接Redis缓存: {}", config.redis_url);

        let client = redis::Client::open(config.redis_url.clone())
            .map_err(|e| QueueError::Cache(e.to_string()))?;

        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::Cache(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Cache(e.to_string()))?;

        info!("Redis缓存连接成功");

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
            command_timeout: config.command_timeout(),
        })
    }

    fn build_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    fn strip_key<'a>(&self, full_key: &'a str) -> &'a str {
        if self.key_prefix.is_empty() {
            return full_key;
        }
        full_key
            .strip_prefix(&self.key_prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(full_key)
    }

    async fn run<T, F>(&self, op: &str, key: &str, fut: F) -> QueueResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!("Redis {} 失败 {}: {}", op, key, e);
                Err(QueueError::Cache(e.to_string()))
            }
            Err(_) => {
                error!("Redis {} 超时 {}", op, key);
                Err(QueueError::Cache(format!("{op} {key} 超时")))
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheProvider for RedisCacheProvider {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .run(
                "GET",
                &full_key,
                redis::cmd("GET").arg(&full_key).query_async(&mut conn),
            )
            .await?;
        debug!("Cache GET {}: {}", full_key, value.is_some());
        Ok(value)
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(&full_key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = self
            .run("SET", &full_key, cmd.query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .run(
                "SET NX",
                &full_key,
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> QueueResult<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .run(
                "DEL",
                &full_key,
                redis::cmd("DEL").arg(&full_key).query_async(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .run(
                "PEXPIRE",
                &full_key,
                redis::cmd("PEXPIRE")
                    .arg(&full_key)
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> QueueResult<i64> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();
        self.run(
            "INCRBY",
            &full_key,
            redis::cmd("INCRBY")
                .arg(&full_key)
                .arg(delta)
                .query_async(&mut conn),
        )
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> QueueResult<Vec<String>> {
        let pattern = format!("{}*", self.build_key(prefix));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    "SCAN",
                    &pattern,
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch.iter().map(|k| self.strip_key(k).to_string()));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
