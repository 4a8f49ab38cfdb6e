//! Task construction and the begin/end adapter.
//!
//! The factory is a stateless wiring helper: it knows which worker pool tasks
//! run on and whether they are bound to a cancellation observer, nothing else.

use std::sync::Arc;

use crate::cancel::CancellationObserver;
use crate::error::{TaskError, WorkResult};
use crate::pool::{RayonPool, WorkerPool};
use crate::task::task::Task;

/// Constructs tasks, starts them, and adapts two-phase begin/end asynchronous
/// operations into tasks.
#[derive(Clone)]
pub struct TaskFactory {
    pool: Arc<dyn WorkerPool>,
    observer: Option<CancellationObserver>,
}

impl Default for TaskFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskFactory {
    /// A factory over the default rayon-backed pool, with no cancellation.
    pub fn new() -> Self {
        Self::with_pool(Arc::new(RayonPool))
    }

    /// A factory submitting to the given pool.
    pub fn with_pool(pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            pool,
            observer: None,
        }
    }

    /// Bind every task created by this factory to a cancellation observer.
    ///
    /// The observer is consulted once per task, immediately before it would
    /// otherwise start; work that is already running is never interrupted.
    pub fn with_cancellation(mut self, observer: CancellationObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cancellation(&self) -> Option<&CancellationObserver> {
        self.observer.as_ref()
    }

    /// Construct a task without starting it.
    ///
    /// One generic method covers both the plain-procedure (`T = ()`) and the
    /// result-bearing variants.
    pub fn task<T, F>(&self, work: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> WorkResult<T> + Send + 'static,
    {
        Task::new(
            Arc::clone(&self.pool),
            self.observer.clone(),
            Box::new(work),
        )
    }

    /// Construct a task, start it, and return it.
    ///
    /// A factory bound to an already-cancelled observer still returns `Ok`;
    /// the task comes back in the `Canceled` terminal state, its work unrun.
    ///
    /// # Errors
    /// Propagates [`TaskError`] from `start()` (not reachable for a freshly
    /// constructed task, but the signature keeps start failures visible).
    pub fn start_new<T, F>(&self, work: F) -> Result<Task<T>, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> WorkResult<T> + Send + 'static,
    {
        let task = self.task(work);
        task.start()?;
        Ok(task)
    }

    /// Adapt a two-phase begin/end asynchronous operation into a task.
    ///
    /// `begin` receives a single-use [`CompletionCallback`] and kicks off the
    /// underlying operation. When the operation finishes (on whatever thread
    /// it uses, possibly synchronously inside `begin`), the producer calls
    /// [`CompletionCallback::complete`] with its handle; that binds the task
    /// body to `end(handle)` and starts the task.
    ///
    /// The task is returned immediately, usually before the operation has
    /// completed: callers must `wait()` or attach continuations. The producer
    /// is expected to complete the callback on both its success and failure
    /// paths (on failure, with a handle whose `end` raises); a callback that
    /// is never invoked leaves the task non-terminal and its waiters blocked.
    pub fn from_begin_end<T, H, B, E>(&self, begin: B, end: E) -> Task<T>
    where
        T: Send + 'static,
        H: Send + 'static,
        B: FnOnce(CompletionCallback<H>),
        E: FnOnce(H) -> WorkResult<T> + Send + 'static,
    {
        let task = Task::unbound(Arc::clone(&self.pool), self.observer.clone());
        let wrapper = task.clone();
        let callback = CompletionCallback::new(move |handle: H| {
            wrapper.bind_work(Box::new(move || end(handle)));
            if let Err(err) = wrapper.start() {
                tracing::warn!(error = %err, "begin/end completion raced an earlier start");
            }
        });
        begin(callback);
        task
    }
}

/// Single-use completion hook handed to the `begin` half of an adapted
/// operation. Consuming it with [`complete`](Self::complete) finishes the
/// wrapping task's setup and starts it.
pub struct CompletionCallback<H> {
    deliver: Option<Box<dyn FnOnce(H) + Send>>,
}

impl<H> CompletionCallback<H> {
    fn new(deliver: impl FnOnce(H) + Send + 'static) -> Self {
        Self {
            deliver: Some(Box::new(deliver)),
        }
    }

    /// Deliver the operation's pending handle, binding and starting the
    /// wrapping task.
    pub fn complete(mut self, handle: H) {
        if let Some(deliver) = self.deliver.take() {
            deliver(handle);
        }
    }
}

impl<H> Drop for CompletionCallback<H> {
    fn drop(&mut self) {
        if self.deliver.is_some() {
            // The producer dropped the callback without firing it; the
            // wrapping task will never become terminal.
            tracing::warn!("begin/end completion callback dropped without firing");
        }
    }
}
