pub mod cache;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod stream;

pub use cache::*;
pub use processor::*;
pub use queue::*;
pub use storage::*;
pub use stream::*;
