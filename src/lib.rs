//! # taskpool
//!
//! A minimal futures/continuation engine: a [`Task`] wraps a unit of work,
//! runs it on a shared worker pool, and lets callers chain follow-up work
//! conditioned on success, failure, or any outcome, with cooperative
//! pre-start cancellation and multi-error aggregation.
//!
//! ## Task Flow
//! 1. A [`TaskFactory`] creates a task from a unit of work, or from a
//!    two-phase begin/end asynchronous operation via
//!    [`TaskFactory::from_begin_end`]
//! 2. `start()` submits execution to the worker pool (or transitions straight
//!    to `Canceled` if the bound cancellation observer says so)
//! 3. On completion the task reaches a terminal state and dispatches its
//!    registered continuations, themselves tasks scheduled the same way
//! 4. Any number of threads can `wait()` on the task or inspect its state,
//!    result, and captured errors
//!
//! ## Modules
//! - `task`: the task node, its state machine, and the factory/adapter
//! - `cancel`: broadcastable cancel flag and its read-only observer views
//! - `error`: lifecycle errors and the ordered fault aggregate
//! - `pool`: the worker-pool seam and the default rayon-backed pool
//!
//! The engine spawns no threads and configures no logging subscriber; it
//! emits `tracing` events and submits jobs to whatever [`WorkerPool`] the
//! host provides.

pub mod cancel;
pub mod error;
pub mod pool;
pub mod task;

pub use cancel::{CancellationObserver, CancellationSignal};
pub use error::{ErrorAggregate, TaskError, WorkError, WorkResult};
pub use pool::{RayonPool, WorkerPool};
pub use task::{CompletionCallback, ContinuationPolicy, Task, TaskFactory, TaskState};
