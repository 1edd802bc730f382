pub mod migrations;
pub mod sqlite_task_storage;

pub use migrations::run_migrations;
pub use sqlite_task_storage::SqliteTaskStorage;
