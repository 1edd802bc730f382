use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskq_core::config::StorageConfig;
use taskq_core::{
    task_ids, CleanupStats, Clock, QueueResult, StorageAdapter, Task, TaskStatus, TaskUpdate,
};
use tracing::{debug, info, instrument, warn};

use super::migrations::run_migrations;
use crate::database::mapping::{MappingHelpers, TASK_COLUMNS};

/// 单条语句中绑定的id上限
const MAX_BIND_IDS: usize = 500;

/// 基于 sqlx 的关系型任务存储
pub struct SqliteTaskStorage {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    stale_threshold: chrono::Duration,
    page_size: usize,
}

impl SqliteTaskStorage {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        let defaults = StorageConfig::default();
        Self {
            pool,
            clock,
            stale_threshold: defaults.stale_threshold(),
            page_size: defaults.mature_page_size,
        }
    }

    pub fn with_limits(mut self, stale_threshold: chrono::Duration, page_size: usize) -> Self {
        self.stale_threshold = stale_threshold;
        self.page_size = page_size.max(1);
        self
    }

    /// 按配置建立连接池并执行迁移
    pub async fn connect(config: &StorageConfig, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        debug!("连接SQLite任务存储: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        run_migrations(&pool).await?;

        info!("SQLite任务存储已就绪");
        Ok(Self::new(pool, clock).with_limits(config.stale_threshold(), config.mature_page_size))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_millis(&self) -> i64 {
        MappingHelpers::to_millis(self.clock.now())
    }

    fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
        qb.push("(");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
    }

    fn push_status_list(qb: &mut QueryBuilder<'_, Sqlite>, statuses: &[TaskStatus]) {
        qb.push("(");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");
    }

    /// 批量状态迁移，只作用于处于 allowed_from 或已经处于目标状态的任务
    async fn transition(
        &self,
        tasks: &[Task],
        target: TaskStatus,
        allowed_from: &[TaskStatus],
    ) -> QueueResult<u64> {
        let ids = task_ids(tasks);
        if ids.is_empty() {
            return Ok(0);
        }

        let now = self.now_millis();
        let mut statuses = allowed_from.to_vec();
        statuses.push(target);

        let mut affected = 0;
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE queue_tasks SET status = ");
            qb.push_bind(target);
            qb.push(", updated_at = ");
            qb.push_bind(now);
            qb.push(" WHERE status IN ");
            Self::push_status_list(&mut qb, &statuses);
            qb.push(" AND id IN ");
            Self::push_id_list(&mut qb, chunk);

            affected += qb.build().execute(&self.pool).await?.rows_affected();
        }

        debug!("{} 个任务迁移到 {}", affected, target);
        Ok(affected)
    }

    async fn count_cleanup_candidates(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        let orphaned: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue_tasks \
             WHERE status = 'processing' AND processing_started_at < ?1",
        )
        .bind(MappingHelpers::to_millis(orphaned_before))
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        let expired: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue_tasks \
             WHERE status IN ('executed', 'failed', 'expired', 'ignored') AND updated_at < ?1",
        )
        .bind(MappingHelpers::to_millis(expired_before))
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        Ok(CleanupStats {
            orphaned: orphaned.max(0) as u64,
            expired: expired.max(0) as u64,
        })
    }
}

#[async_trait]
impl StorageAdapter for SqliteTaskStorage {
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn add_tasks_to_scheduled(&self, tasks: &[Task]) -> QueueResult<Vec<Task>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut persisted = Vec::with_capacity(tasks.len());
        let mut tx = self.pool.begin().await?;

        for task in tasks {
            let mut task = task.clone();
            if task.id.is_none() {
                task.id = Some(self.generate_id());
            }
            task.status = TaskStatus::Scheduled;
            task.processing_started_at = None;
            task.updated_at = now;

            let payload = match serde_json::to_string(&task.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("任务 {} 载荷序列化失败，跳过: {}", task.describe(), e);
                    continue;
                }
            };
            let stats = serde_json::to_string(&task.execution_stats)?;
            let result = task
                .execution_result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let outcome = sqlx::query(
                r#"
                INSERT INTO queue_tasks (id, queue_id, task_type, payload, status, execute_at,
                    expires_at, created_at, updated_at, processing_started_at, retries,
                    execution_stats, retry_after, task_group, task_hash, force_store, execution_result)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(task.id.as_deref())
            .bind(&task.queue_id)
            .bind(&task.task_type)
            .bind(payload)
            .bind(task.status)
            .bind(MappingHelpers::to_millis(task.execute_at))
            .bind(task.expires_at.map(MappingHelpers::to_millis))
            .bind(MappingHelpers::to_millis(task.created_at))
            .bind(MappingHelpers::to_millis(task.updated_at))
            .bind(i64::from(task.retries))
            .bind(stats)
            .bind(task.retry_after_ms as i64)
            .bind(task.task_group.as_deref())
            .bind(task.task_hash.as_deref())
            .bind(task.force_store)
            .bind(result)
            .execute(&mut *tx)
            .await?;

            if outcome.rows_affected() == 1 {
                persisted.push(task);
            } else {
                debug!("任务 {} 已存在，跳过", task.describe());
            }
        }

        tx.commit().await?;

        debug!("写入 {}/{} 个待调度任务", persisted.len(), tasks.len());
        Ok(persisted)
    }

    #[instrument(skip(self))]
    async fn get_mature_tasks(&self, now: DateTime<Utc>) -> QueueResult<Vec<Task>> {
        let current = self.now_millis();
        let stale_before = MappingHelpers::to_millis(self.clock.now() - self.stale_threshold);

        let reset = sqlx::query(
            "UPDATE queue_tasks SET status = 'scheduled', processing_started_at = NULL, updated_at = ?1 \
             WHERE status = 'processing' AND processing_started_at < ?2",
        )
        .bind(current)
        .bind(stale_before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reset > 0 {
            warn!("{} 个任务长时间停留在processing状态，已重新调度", reset);
            metrics::counter!("taskq_stale_tasks_recovered_total", "backend" => "sqlite")
                .increment(reset);
        }

        let sql = format!(
            "UPDATE queue_tasks SET status = 'processing', processing_started_at = ?1, updated_at = ?1 \
             WHERE id IN (SELECT id FROM queue_tasks WHERE status = 'scheduled' AND execute_at <= ?2 \
             ORDER BY execute_at LIMIT ?3) \
             RETURNING {TASK_COLUMNS}"
        );

        let rows = sqlx::query(&sql)
            .bind(current)
            .bind(MappingHelpers::to_millis(now))
            .bind(self.page_size as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = rows
            .iter()
            .map(MappingHelpers::row_to_task)
            .collect::<QueueResult<Vec<_>>>()?;
        tasks.sort_by_key(|t| t.execute_at);

        debug!("认领 {} 个到期任务", tasks.len());
        metrics::counter!("taskq_tasks_claimed_total", "backend" => "sqlite")
            .increment(tasks.len() as u64);
        Ok(tasks)
    }

    async fn mark_tasks_as_processing(
        &self,
        tasks: &[Task],
        started_at: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let ids = task_ids(tasks);
        if ids.is_empty() {
            return Ok(0);
        }

        let started = MappingHelpers::to_millis(started_at);
        let mut affected = 0;
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "UPDATE queue_tasks SET status = 'processing', processing_started_at = ",
            );
            qb.push_bind(started);
            qb.push(", updated_at = ");
            qb.push_bind(self.now_millis());
            qb.push(" WHERE status IN ('scheduled', 'processing') AND id IN ");
            Self::push_id_list(&mut qb, chunk);

            affected += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(affected)
    }

    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn mark_tasks_as_executed(&self, tasks: &[Task]) -> QueueResult<u64> {
        let now = self.now_millis();
        let mut affected = 0;
        let mut tx = self.pool.begin().await?;

        for task in tasks {
            let Some(id) = task.id.as_deref() else {
                continue;
            };
            let result = task
                .execution_result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            affected += sqlx::query(
                "UPDATE queue_tasks SET status = 'executed', updated_at = ?1, \
                 execution_result = COALESCE(?2, execution_result) \
                 WHERE id = ?3 AND status IN ('scheduled', 'processing', 'executed')",
            )
            .bind(now)
            .bind(result)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn mark_tasks_as_failed(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.transition(
            tasks,
            TaskStatus::Failed,
            &[TaskStatus::Scheduled, TaskStatus::Processing],
        )
        .await
    }

    async fn mark_tasks_as_ignored(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.transition(
            tasks,
            TaskStatus::Ignored,
            &[TaskStatus::Scheduled, TaskStatus::Processing],
        )
        .await
    }

    async fn mark_tasks_as_expired(&self, tasks: &[Task]) -> QueueResult<u64> {
        self.transition(
            tasks,
            TaskStatus::Expired,
            &[TaskStatus::Scheduled, TaskStatus::Processing],
        )
        .await
    }

    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn update_tasks(&self, updates: &[TaskUpdate]) -> QueueResult<Vec<String>> {
        let now = self.now_millis();
        let mut matched = Vec::with_capacity(updates.len());
        let mut tx = self.pool.begin().await?;

        for update in updates {
            let patch = &update.patch;
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE queue_tasks SET updated_at = ");
            qb.push_bind(now);
            if let Some(status) = patch.status {
                qb.push(", status = ");
                qb.push_bind(status);
            }
            if let Some(execute_at) = patch.execute_at {
                qb.push(", execute_at = ");
                qb.push_bind(MappingHelpers::to_millis(execute_at));
            }
            if let Some(retries) = patch.retries {
                qb.push(", retries = ");
                qb.push_bind(i64::from(retries));
            }
            if let Some(stats) = &patch.execution_stats {
                qb.push(", execution_stats = ");
                qb.push_bind(serde_json::to_string(stats)?);
            }
            if let Some(started) = patch.processing_started_at {
                qb.push(", processing_started_at = ");
                qb.push_bind(started.map(MappingHelpers::to_millis));
            }
            if let Some(result) = &patch.execution_result {
                qb.push(", execution_result = ");
                qb.push_bind(serde_json::to_string(result)?);
            }
            if let Some(payload) = &patch.payload {
                qb.push(", payload = ");
                qb.push_bind(serde_json::to_string(payload)?);
            }
            qb.push(" WHERE id = ");
            qb.push_bind(update.id.clone());

            if qb.build().execute(&mut *tx).await?.rows_affected() > 0 {
                matched.push(update.id.clone());
            }
        }

        tx.commit().await?;
        Ok(matched)
    }

    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn upsert_tasks(&self, tasks: &[Task]) -> QueueResult<Vec<Task>> {
        let now = self.clock.now();
        let mut written = Vec::with_capacity(tasks.len());

        for task in tasks {
            let mut task = task.clone();
            if task.id.is_none() {
                task.id = Some(self.generate_id());
            }
            task.updated_at = now;

            let payload = serde_json::to_string(&task.payload)?;
            let stats = serde_json::to_string(&task.execution_stats)?;
            let result = task
                .execution_result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let outcome = sqlx::query(
                r#"
                INSERT INTO queue_tasks (id, queue_id, task_type, payload, status, execute_at,
                    expires_at, created_at, updated_at, processing_started_at, retries,
                    execution_stats, retry_after, task_group, task_hash, force_store, execution_result)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                ON CONFLICT(id) DO UPDATE SET
                    queue_id = excluded.queue_id,
                    task_type = excluded.task_type,
                    payload = excluded.payload,
                    status = excluded.status,
                    execute_at = excluded.execute_at,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at,
                    processing_started_at = excluded.processing_started_at,
                    retries = excluded.retries,
                    execution_stats = excluded.execution_stats,
                    retry_after = excluded.retry_after,
                    task_group = excluded.task_group,
                    task_hash = excluded.task_hash,
                    force_store = excluded.force_store,
                    execution_result = excluded.execution_result
                "#,
            )
            .bind(task.id.as_deref())
            .bind(&task.queue_id)
            .bind(&task.task_type)
            .bind(payload)
            .bind(task.status)
            .bind(MappingHelpers::to_millis(task.execute_at))
            .bind(task.expires_at.map(MappingHelpers::to_millis))
            .bind(MappingHelpers::to_millis(task.created_at))
            .bind(MappingHelpers::to_millis(task.updated_at))
            .bind(task.processing_started_at.map(MappingHelpers::to_millis))
            .bind(i64::from(task.retries))
            .bind(stats)
            .bind(task.retry_after_ms as i64)
            .bind(task.task_group.as_deref())
            .bind(task.task_hash.as_deref())
            .bind(task.force_store)
            .bind(result)
            .execute(&self.pool)
            .await;

            match outcome {
                Ok(_) => written.push(task),
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    warn!("任务 {} 与已有任务的 task_hash 冲突，跳过", task.describe());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(written)
    }

    async fn get_tasks_by_ids(&self, ids: &[String]) -> QueueResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {TASK_COLUMNS} FROM queue_tasks WHERE id IN "
            ));
            Self::push_id_list(&mut qb, chunk);

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                tasks.push(MappingHelpers::row_to_task(row)?);
            }
        }
        Ok(tasks)
    }

    async fn get_cleanup_stats(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        self.count_cleanup_candidates(orphaned_before, expired_before)
            .await
    }

    #[instrument(skip(self))]
    async fn cleanup_tasks(
        &self,
        orphaned_before: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> QueueResult<CleanupStats> {
        let mut tx = self.pool.begin().await?;

        let orphaned = sqlx::query(
            "DELETE FROM queue_tasks WHERE status = 'processing' AND processing_started_at < ?1",
        )
        .bind(MappingHelpers::to_millis(orphaned_before))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let expired = sqlx::query(
            "DELETE FROM queue_tasks \
             WHERE status IN ('executed', 'failed', 'expired', 'ignored') AND updated_at < ?1",
        )
        .bind(MappingHelpers::to_millis(expired_before))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let stats = CleanupStats { orphaned, expired };
        if stats.total() > 0 {
            info!(
                "清理任务完成: 孤儿任务 {}, 过期任务 {}",
                stats.orphaned, stats.expired
            );
        }
        Ok(stats)
    }

    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
