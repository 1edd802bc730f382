pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod namespace;
pub mod traits;

pub use clock::{system_clock, Clock, SystemClock};
pub use errors::{QueueError, QueueResult};
pub use logging::init_logging;
pub use models::*;
pub use namespace::QueueNamespace;
pub use traits::*;
