use sqlx::SqlitePool;
use taskq_core::QueueResult;
use tracing::debug;

/// 创建任务表与索引
///
/// 时间戳统一以毫秒整数保存。task_hash 只在仍需执行的任务之间去重。
pub async fn run_migrations(pool: &SqlitePool) -> QueueResult<()> {
    debug!("运行SQLite任务表迁移");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_tasks (
            id TEXT PRIMARY KEY,
            queue_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'scheduled',
            execute_at INTEGER NOT NULL,
            expires_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            processing_started_at INTEGER,
            retries INTEGER NOT NULL DEFAULT 0,
            execution_stats TEXT NOT NULL DEFAULT '{}',
            retry_after INTEGER NOT NULL DEFAULT 2000,
            task_group TEXT,
            task_hash TEXT,
            force_store INTEGER NOT NULL DEFAULT 0,
            execution_result TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_queue_tasks_mature ON queue_tasks(status, execute_at)",
        "CREATE INDEX IF NOT EXISTS idx_queue_tasks_processing ON queue_tasks(status, processing_started_at)",
        "CREATE INDEX IF NOT EXISTS idx_queue_tasks_updated ON queue_tasks(status, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_queue_tasks_group ON queue_tasks(queue_id, task_group)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_tasks_hash ON queue_tasks(queue_id, task_hash) \
         WHERE task_hash IS NOT NULL AND status IN ('scheduled', 'processing')",
    ];

    for index_sql in indexes {
        sqlx::query(index_sql).execute(pool).await?;
    }

    debug!("SQLite任务表迁移完成");
    Ok(())
}
