//! Core `Task` type: lifecycle state machine, continuation buckets, and the
//! completion gate.
//!
//! # Invariants
//! - A task is started at most once; a second attempt is an error.
//! - `state` is monotonic and follows the state machine below.
//! - Every continuation bucket entry is started exactly once: synchronously at
//!   registration when the antecedent is already terminal and matching, else
//!   exactly once by the matching transition.
//! - The completion gate is set exactly once per task, after the terminal
//!   transition and after continuation dispatch for that transition has been
//!   initiated.

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::cancel::CancellationObserver;
use crate::error::{ErrorAggregate, TaskError, WorkResult};
use crate::pool::WorkerPool;

/// Lifecycle state of a task.
///
/// # State Machine
/// ```text
/// NotStarted -> Running -> RanToCompletion
///           \           \-> Faulted
///            \-> Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not yet started
    NotStarted,
    /// Submitted to the worker pool (work may or may not have begun)
    Running,
    /// Work returned normally
    RanToCompletion,
    /// Work raised an error, captured in an [`ErrorAggregate`]
    Faulted,
    /// Cancelled before the work ever ran
    Canceled,
}

impl TaskState {
    /// `true` for RanToCompletion, Faulted, and Canceled.
    ///
    /// # Property
    /// `is_terminal() => !can_transition()`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::RanToCompletion | TaskState::Faulted | TaskState::Canceled
        )
    }
}

/// Selects which continuation bucket a registration lands in.
///
/// Only the three recognised buckets are representable, so there is no
/// rejected-policy error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationPolicy {
    /// Run only if the antecedent ran to completion
    OnlyOnSuccess,
    /// Run only if the antecedent faulted
    OnlyOnFaulted,
    /// Run once the antecedent reaches any terminal state
    Any,
}

impl ContinuationPolicy {
    /// Whether a terminal `state` qualifies this bucket for dispatch.
    ///
    /// `Any` matches every terminal state, Canceled included: leaving
    /// any-outcome continuations pending on a cancelled antecedent would
    /// stall them (and their waiters) forever.
    fn matches(self, state: TaskState) -> bool {
        match self {
            ContinuationPolicy::OnlyOnSuccess => state == TaskState::RanToCompletion,
            ContinuationPolicy::OnlyOnFaulted => state == TaskState::Faulted,
            ContinuationPolicy::Any => state.is_terminal(),
        }
    }
}

pub(crate) type WorkFn<T> = Box<dyn FnOnce() -> WorkResult<T> + Send>;

/// A unit of deferred, possibly asynchronous work with observable completion
/// state.
///
/// `Task` is a cheaply cloneable handle; clones observe the same underlying
/// node. There is no separate plain-procedure task type: the unit and
/// result-bearing variants are one tagged entity, `Task<()>` vs `Task<T>`.
///
/// After `start()`, the node is shared between the creating thread, the pool
/// thread executing the work, and any thread waiting or registering
/// continuations; all mutable state is guarded by a single per-task critical
/// section.
pub struct Task<T = ()> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    core: Mutex<Core<T>>,
    gate: CompletionGate,
    pool: Arc<dyn WorkerPool>,
    observer: Option<CancellationObserver>,
}

struct Core<T> {
    state: TaskState,
    work: Option<WorkFn<T>>,
    result: Option<T>,
    error: Option<Arc<ErrorAggregate>>,
    on_success: Vec<Task<()>>,
    on_fault: Vec<Task<()>>,
    on_any: Vec<Task<()>>,
}

impl<T: Send + 'static> Task<T> {
    pub(crate) fn new(
        pool: Arc<dyn WorkerPool>,
        observer: Option<CancellationObserver>,
        work: WorkFn<T>,
    ) -> Self {
        Self::build(pool, observer, Some(work))
    }

    /// A task whose work is bound later, by a begin/end completion callback.
    pub(crate) fn unbound(
        pool: Arc<dyn WorkerPool>,
        observer: Option<CancellationObserver>,
    ) -> Self {
        Self::build(pool, observer, None)
    }

    fn build(
        pool: Arc<dyn WorkerPool>,
        observer: Option<CancellationObserver>,
        work: Option<WorkFn<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: TaskState::NotStarted,
                    work,
                    result: None,
                    error: None,
                    on_success: Vec::new(),
                    on_fault: Vec::new(),
                    on_any: Vec::new(),
                }),
                gate: CompletionGate::new(),
                pool,
                observer,
            }),
        }
    }

    /// Bind the work of an adapter-created task. Must happen before `start()`.
    pub(crate) fn bind_work(&self, work: WorkFn<T>) {
        self.lock_core().work = Some(work);
    }

    /// Start the task.
    ///
    /// If the bound cancellation observer reports cancellation, transitions
    /// directly to `Canceled` without ever scheduling the work: any-outcome
    /// continuations are dispatched and waiters are released, exactly as for
    /// the other terminal states. Returns `Ok(())` in that case; cancellation
    /// is an outcome, not a caller error.
    ///
    /// # Errors
    /// [`TaskError::AlreadyStarted`] if called more than once, in any state.
    pub fn start(&self) -> Result<(), TaskError> {
        enum Launch {
            Schedule,
            Cancelled(Vec<Task<()>>),
        }

        let launch = {
            let mut core = self.lock_core();
            match core.state {
                TaskState::NotStarted => {
                    let cancelled = self
                        .inner
                        .observer
                        .as_ref()
                        .is_some_and(CancellationObserver::is_cancelled);
                    if cancelled {
                        core.state = TaskState::Canceled;
                        core.work = None;
                        Launch::Cancelled(mem::take(&mut core.on_any))
                    } else {
                        core.state = TaskState::Running;
                        Launch::Schedule
                    }
                }
                _ => return Err(TaskError::AlreadyStarted),
            }
        };

        match launch {
            Launch::Schedule => {
                let task = self.clone();
                self.inner.pool.submit(Box::new(move || task.execute()));
            }
            Launch::Cancelled(continuations) => {
                tracing::debug!("task cancelled before start");
                dispatch(continuations);
                self.inner.gate.set();
            }
        }
        Ok(())
    }

    /// Pool-thread entry point: run the work and complete the task.
    fn execute(&self) {
        let work = self.lock_core().work.take();
        let outcome = match work {
            Some(work) => panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref()).into())),
            // Reachable only if a begin/end completion callback started the
            // task without binding work first.
            None => Err("task work was never bound".into()),
        };

        // The terminal transition and the bucket drain happen in one critical
        // section; a racing continue_with either lands in the drained bucket
        // or observes the terminal state and self-dispatches. Matching bucket
        // first, any-outcome bucket second; the non-matching bucket is never
        // drained and its entries never start.
        let continuations = {
            let mut core = self.lock_core();
            match outcome {
                Ok(value) => {
                    core.result = Some(value);
                    core.state = TaskState::RanToCompletion;
                    let mut run = mem::take(&mut core.on_success);
                    run.append(&mut core.on_any);
                    run
                }
                Err(error) => {
                    tracing::debug!(error = %error, "task faulted");
                    core.error = Some(Arc::new(ErrorAggregate::from_error(error)));
                    core.state = TaskState::Faulted;
                    let mut run = mem::take(&mut core.on_fault);
                    run.append(&mut core.on_any);
                    run
                }
            }
        };

        dispatch(continuations);
        self.inner.gate.set();
    }

    /// Register a continuation: a dependent task whose body invokes `action`
    /// with a handle to this task.
    ///
    /// The dependent lands in the bucket selected by `policy`. If this task
    /// is already terminal and matches the bucket, the dependent is started
    /// immediately, on the calling thread (its body still runs on the pool).
    /// If this task is already terminal and does *not* match, the dependent
    /// is returned unstarted and will never run.
    ///
    /// Returns the dependent task so chains compose fluently.
    pub fn continue_with<F>(&self, action: F, policy: ContinuationPolicy) -> Task<()>
    where
        F: FnOnce(Task<T>) -> WorkResult<()> + Send + 'static,
    {
        let dependent = self.continuation_task(action);
        let start_now = {
            let mut core = self.lock_core();
            if core.state.is_terminal() {
                policy.matches(core.state)
            } else {
                let bucket = match policy {
                    ContinuationPolicy::OnlyOnSuccess => &mut core.on_success,
                    ContinuationPolicy::OnlyOnFaulted => &mut core.on_fault,
                    ContinuationPolicy::Any => &mut core.on_any,
                };
                bucket.push(dependent.clone());
                false
            }
        };
        if start_now {
            if let Err(err) = dependent.start() {
                tracing::warn!(error = %err, "late continuation could not be started");
            }
        }
        dependent
    }

    /// Build the dependent task for `continue_with`. The action captures a
    /// clone of this handle (the shared node, not a snapshot), so it observes
    /// the antecedent's real terminal state when it runs.
    fn continuation_task<F>(&self, action: F) -> Task<()>
    where
        F: FnOnce(Task<T>) -> WorkResult<()> + Send + 'static,
    {
        let parent = self.clone();
        Task::new(
            Arc::clone(&self.inner.pool),
            self.inner.observer.clone(),
            Box::new(move || action(parent)),
        )
    }

    /// Block the calling thread until the task reaches any terminal state.
    ///
    /// No timeout; all concurrent waiters are released together. Captured
    /// work errors are *not* rethrown here; inspect [`Task::error`] after
    /// waiting.
    pub fn wait(&self) {
        self.inner.gate.wait();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.lock_core().state
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::RanToCompletion
    }

    pub fn is_faulted(&self) -> bool {
        self.state() == TaskState::Faulted
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Canceled
    }

    /// The captured errors, present only once the task has faulted.
    pub fn error(&self) -> Option<Arc<ErrorAggregate>> {
        self.lock_core().error.clone()
    }

    fn lock_core(&self) -> MutexGuard<'_, Core<T>> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// The work's value, present only once the task has run to completion.
    ///
    /// Reading before completion (or after a fault or cancellation) yields
    /// `None`; it never blocks and never fails.
    pub fn result(&self) -> Option<T> {
        self.lock_core().result.clone()
    }
}

/// Start each continuation in registration order. Dispatch initiation is
/// ordered; execution order across pool threads is not.
fn dispatch(continuations: Vec<Task<()>>) {
    for task in continuations {
        if let Err(err) = task.start() {
            tracing::warn!(error = %err, "continuation could not be started");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task work panicked".to_string()
    }
}

/// Manual-reset completion event: set exactly once, observable by any number
/// of waiting threads, before or after the fact.
struct CompletionGate {
    done: Mutex<bool>,
    signal: Condvar,
}

impl CompletionGate {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.signal.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .signal
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSignal;
    use crate::task::factory::TaskFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn trace_init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn test_completed_and_faulted_are_mutually_exclusive() {
        let factory = TaskFactory::new();

        let ok = factory.start_new(|| Ok(())).unwrap();
        ok.wait();
        assert!(ok.is_completed());
        assert!(!ok.is_faulted());

        let bad = factory
            .start_new(|| -> crate::error::WorkResult<()> { Err("boom".into()) })
            .unwrap();
        bad.wait();
        assert!(bad.is_faulted());
        assert!(!bad.is_completed());

        let signal = CancellationSignal::new();
        signal.cancel();
        let factory = TaskFactory::new().with_cancellation(signal.observer());
        let cancelled = factory.start_new(|| Ok(())).unwrap();
        cancelled.wait();
        assert!(!cancelled.is_completed());
        assert!(!cancelled.is_faulted());
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_double_start_fails_and_fires_nothing_twice() {
        let factory = TaskFactory::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let task = factory.task(|| Ok(()));
        let counter = Arc::clone(&fired);
        let dependent = task.continue_with(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            ContinuationPolicy::Any,
        );

        task.start().unwrap();
        assert!(matches!(task.start(), Err(TaskError::AlreadyStarted)));

        task.wait();
        dependent.wait();
        assert!(matches!(task.start(), Err(TaskError::AlreadyStarted)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_starts_in_the_same_call() {
        let factory = TaskFactory::new();
        let task = factory.start_new(|| Ok(5usize)).unwrap();
        task.wait();

        let observed = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&observed);
        let dependent = task.continue_with(
            move |parent| {
                sink.store(parent.result().unwrap_or_default(), Ordering::SeqCst);
                Ok(())
            },
            ContinuationPolicy::OnlyOnSuccess,
        );

        // Already scheduled by continue_with itself; no external wait on the
        // antecedent is needed for the dependent to make progress.
        assert_ne!(dependent.state(), TaskState::NotStarted);
        dependent.wait();
        assert_eq!(observed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_early_registration_fires_exactly_once() {
        let factory = TaskFactory::new();
        let task = factory.task(|| {
            thread::sleep(Duration::from_millis(10));
            Ok(())
        });

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let dependent = task.continue_with(
            move |parent| {
                assert!(parent.state().is_terminal());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            ContinuationPolicy::OnlyOnSuccess,
        );
        assert_eq!(dependent.state(), TaskState::NotStarted);

        task.start().unwrap();
        dependent.wait();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_releases_every_waiter() {
        let factory = TaskFactory::new();
        let task = factory.task(|| {
            thread::sleep(Duration::from_millis(10));
            Ok(())
        });

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let handle = task.clone();
            waiters.push(thread::spawn(move || handle.wait()));
        }
        task.start().unwrap();
        for waiter in waiters {
            waiter.join().expect("waiter should not panic");
        }

        // Waiting after completion returns immediately.
        task.wait();
        assert!(task.is_completed());
    }

    #[test]
    fn test_success_continuation_observes_completed_parent() {
        let factory = TaskFactory::new();
        let task = factory.task(|| Ok(()));

        let saw_completed = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&saw_completed);
        let dependent = task.continue_with(
            move |parent| {
                if parent.is_completed() {
                    sink.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            },
            ContinuationPolicy::OnlyOnSuccess,
        );

        task.start().unwrap();
        task.wait();
        dependent.wait();
        assert!(task.is_completed());
        assert_eq!(saw_completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fault_continuation_runs_success_continuation_never_does() {
        let factory = TaskFactory::new();
        let task =
            factory.task(|| -> crate::error::WorkResult<()> { Err("deliberate failure".into()) });

        let fault_seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&fault_seen);
        let on_fault = task.continue_with(
            move |parent| {
                assert!(parent.is_faulted());
                let error = parent.error().expect("faulted task must carry errors");
                assert!(!error.is_empty());
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            ContinuationPolicy::OnlyOnFaulted,
        );
        let on_success = task.continue_with(|_| Ok(()), ContinuationPolicy::OnlyOnSuccess);

        task.start().unwrap();
        task.wait();
        on_fault.wait();

        assert_eq!(fault_seen.load(Ordering::SeqCst), 1);
        // The success bucket is never drained on a fault; its entry stays
        // unstarted forever.
        assert_eq!(on_success.state(), TaskState::NotStarted);
        assert_eq!(
            task.error().expect("error must be set").to_string(),
            "deliberate failure"
        );
    }

    #[test]
    fn test_continuation_chain_runs_in_order() {
        let factory = TaskFactory::new();
        let (tx, rx) = mpsc::channel();

        let first = factory.task(|| Ok(1));
        let tx1 = tx.clone();
        let second = first.continue_with(
            move |parent| {
                tx1.send(parent.result().unwrap_or_default()).ok();
                Ok(())
            },
            ContinuationPolicy::OnlyOnSuccess,
        );
        let tx2 = tx.clone();
        let third = second.continue_with(
            move |_| {
                tx2.send(2).ok();
                Ok(())
            },
            ContinuationPolicy::Any,
        );

        first.start().unwrap();
        third.wait();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn test_faulting_continuation_becomes_a_faulted_task() {
        let factory = TaskFactory::new();
        let task = factory.task(|| Ok(()));
        let dependent = task.continue_with(
            |_| -> crate::error::WorkResult<()> { Err("continuation blew up".into()) },
            ContinuationPolicy::Any,
        );

        task.start().unwrap();
        dependent.wait();
        assert!(dependent.is_faulted());
        let error = dependent.error().expect("continuation fault captured");
        assert_eq!(error.to_string(), "continuation blew up");
    }

    #[test]
    fn test_panicking_work_faults_instead_of_crashing() {
        let factory = TaskFactory::new();
        let task = factory
            .start_new(|| -> crate::error::WorkResult<()> { panic!("unexpected condition") })
            .unwrap();
        task.wait();
        assert!(task.is_faulted());
        let error = task.error().expect("panic captured as fault");
        assert_eq!(error.to_string(), "unexpected condition");
    }

    #[test]
    fn test_pre_start_cancellation_is_terminal_and_releases_waiters() {
        let signal = CancellationSignal::new();
        let factory = TaskFactory::new().with_cancellation(signal.observer());
        let task = factory.task(|| Ok(()));

        let waiter_task = task.clone();
        let waiter = thread::spawn(move || waiter_task.wait());

        signal.cancel();
        task.start().unwrap();
        waiter.join().expect("waiter released");

        assert_eq!(task.state(), TaskState::Canceled);
        // The work never ran, so there is neither a result nor an error.
        assert!(task.result().is_none());
        assert!(task.error().is_none());
        assert!(matches!(task.start(), Err(TaskError::AlreadyStarted)));
    }

    #[test]
    fn test_cancelled_task_dispatches_any_outcome_bucket() {
        let signal = CancellationSignal::new();
        signal.cancel();
        let factory = TaskFactory::new().with_cancellation(signal.observer());

        let task = factory.task(|| Ok(()));
        // An Any continuation inherits the cancelled observer, so it is
        // itself cancelled at dispatch. Both outcomes are terminal; nothing
        // stalls and both waits below return.
        let inherited = task.continue_with(|_| Ok(()), ContinuationPolicy::Any);

        task.start().unwrap();
        task.wait();
        inherited.wait();
        assert!(task.is_cancelled());
        assert!(inherited.is_cancelled());
    }

    #[test]
    fn test_concurrent_registration_during_completion_fires_each_exactly_once() {
        trace_init();
        let factory = TaskFactory::new();
        let task = factory.task(|| {
            thread::sleep(Duration::from_millis(5));
            Ok(())
        });
        task.start().unwrap();

        const THREADS: usize = 8;
        const PER_THREAD: usize = 16;
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        let mut registrars = Vec::new();
        for _ in 0..THREADS {
            let task = task.clone();
            let fired = Arc::clone(&fired);
            let tx = tx.clone();
            registrars.push(thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    let counter = Arc::clone(&fired);
                    let dependent = task.continue_with(
                        move |parent| {
                            assert!(parent.state().is_terminal());
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                        ContinuationPolicy::Any,
                    );
                    tx.send(dependent).expect("collector alive");
                }
            }));
        }
        drop(tx);

        for registrar in registrars {
            registrar.join().expect("registrar should not panic");
        }
        for dependent in rx {
            dependent.wait();
        }
        assert_eq!(fired.load(Ordering::SeqCst), THREADS * PER_THREAD);
    }
}
