//! Cooperative pre-start cancellation.
//!
//! One [`CancellationSignal`] owns the cancel flag; any number of
//! [`CancellationObserver`] views can be derived from it. Cancellation is a
//! one-way transition (`NotCancelled -> Cancelled`) broadcast synchronously to
//! every registered observer, in registration order, on the cancelling thread.
//!
//! The engine consults an observer exactly once, immediately before a task
//! would otherwise start. Work that is already running is never interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::TaskError;

/// Broadcastable cancel flag with back-references to its observers.
///
/// # Invariants
/// - The flag only ever transitions `false -> true`.
/// - An observer created from an already-cancelled signal is born cancelled;
///   there is no window in which it reads a stale `false` forever.
#[derive(Debug, Default)]
pub struct CancellationSignal {
    cancelled: AtomicBool,
    observers: Mutex<Vec<Weak<AtomicBool>>>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `cancel()` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Set the flag and notify every registered observer.
    ///
    /// Notification is synchronous, on the calling thread, in registration
    /// order. Calling this more than once is harmless.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let observers = self.lock_observers();
        let mut notified = 0usize;
        for flag in observers.iter().filter_map(Weak::upgrade) {
            flag.store(true, Ordering::SeqCst);
            notified += 1;
        }
        tracing::debug!(observers = notified, "cancellation signalled");
    }

    /// Derive a fresh, independently-queryable view of this signal.
    ///
    /// Each call registers a new observer; observers from the same signal are
    /// independent values, not a shared handle.
    pub fn observer(&self) -> CancellationObserver {
        let mut observers = self.lock_observers();
        let flag = Arc::new(AtomicBool::new(false));
        observers.push(Arc::downgrade(&flag));
        // Initialised while the registration lock is held: a concurrent
        // cancel() either notifies the entry just pushed or is seen by this
        // load. Either way the new observer cannot miss the cancellation.
        if self.cancelled.load(Ordering::SeqCst) {
            flag.store(true, Ordering::SeqCst);
        }
        CancellationObserver { flag }
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<Weak<AtomicBool>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only view of a [`CancellationSignal`]'s state.
///
/// Cloning an observer shares the same view; derive a new one from the signal
/// if an independent registration is wanted.
#[derive(Debug, Clone)]
pub struct CancellationObserver {
    flag: Arc<AtomicBool>,
}

impl CancellationObserver {
    /// Plain read of the cancel flag.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`TaskError::Cancelled`] if the flag is set.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}
