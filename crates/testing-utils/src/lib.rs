//! # taskq Testing Utils
//!
//! Shared testing utilities for the taskq workspace.
//!
//! - **Builders**: `TaskBuilder` and stream record helpers with sensible defaults
//! - **Mocks**: `ManualClock`, `ScriptedExecutor`, `RecordingProcessor` and `FailingStorage`
//! - **Helpers**: in-memory storage setup and polling helpers
//!
//! ```toml
//! [dev-dependencies]
//! taskq-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
