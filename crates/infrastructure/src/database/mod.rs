pub mod document;
pub mod mapping;
pub mod sqlite;

pub use document::{DocumentTaskStorage, InMemoryTaskCollection, TaskCollection, TaskFilter};
pub use mapping::MappingHelpers;
pub use sqlite::SqliteTaskStorage;
