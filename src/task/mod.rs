//! Task lifecycle, continuation dispatch, and construction helpers.
//!
//! `task` holds the future/continuation node itself; `factory` holds the
//! construction and begin/end adaptation surface.

pub mod factory;
pub mod task;

pub use factory::{CompletionCallback, TaskFactory};
pub use task::{ContinuationPolicy, Task, TaskState};
