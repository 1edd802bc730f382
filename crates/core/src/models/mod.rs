pub mod batch;
pub mod task;

pub use batch::*;
pub use task::*;
