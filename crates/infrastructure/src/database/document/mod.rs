pub mod collection;
pub mod document_task_storage;

pub use collection::{InMemoryTaskCollection, TaskCollection, TaskFilter};
pub use document_task_storage::DocumentTaskStorage;
