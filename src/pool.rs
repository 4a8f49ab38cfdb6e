//! Worker pool seam.
//!
//! The engine spawns no threads of its own; it only submits work items to an
//! externally-owned pool through this trait.

/// A pool that executes submitted jobs in parallel on an unspecified number
/// of threads. Submission must be unbounded: the engine never queues or
/// applies backpressure on top of it.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Submits jobs to rayon's global thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct RayonPool;

impl WorkerPool for RayonPool {
    fn submit(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        rayon::spawn(job);
    }
}
