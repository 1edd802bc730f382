pub mod app;
pub mod shutdown;

pub use app::{Application, RunningApplication, LOG_TASK_TYPE};
pub use shutdown::ShutdownManager;
