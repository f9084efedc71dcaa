//! One-shot observable futures.
//!
//! A [`Future`] wraps a zero-argument action together with its terminal
//! state: the result or the captured failure, a completion flag, and a
//! cancellation flag. Whoever submits work constructs the future; exactly
//! one servicing thread (scheduler loop, worker loop, or the caller itself)
//! runs it, at most once, via [`Future::complete`].
//!
//! Cancellation is cooperative and non-preemptive: the flag is consulted
//! once, immediately before the action would start. An action already in
//! flight cannot be interrupted, and cancelling a completed future is a
//! safe no-op.

use crate::cleanup::CloseGuard;
use crate::error::FutureError;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Wait length above which `get_result` arms a teardown guard, so a caller
/// blocked through process shutdown is cancelled and woken instead of
/// hanging.
const GUARD_THRESHOLD: Duration = Duration::from_secs(1);

/// A foreign notification target signalled when a future completes.
///
/// Installed via [`Future::set_external_waker`]; the muxer uses this to
/// learn about completions across many futures. The wake happens strictly
/// after the future's own lock is released.
pub trait FutureWaker: Send + Sync {
    /// Signal that one tracked future has reached a terminal state.
    fn wake(&self);
}

/// Outcome of running a single chain link: the next link to run, or the
/// captured action failure.
pub(crate) type Step = Result<Option<Arc<dyn Runnable>>, FutureError>;

/// Type-erasure seam over `Future<T>`.
///
/// Lets the scheduler heap and worker queue hold futures of heterogeneous
/// result types, and lets a `Future<U>` chain onto a `Future<T>`.
pub(crate) trait Runnable: Send + Sync {
    /// Run this link's action and hand back the continuation, if any.
    fn step(&self) -> Step;

    /// Request cancellation; returns whether the future had not completed.
    fn cancel(&self) -> bool;

    /// Whether the future reached a terminal result or failure.
    fn is_completed(&self) -> bool;

    /// Whether cancellation was requested.
    fn is_cancelled(&self) -> bool;

    /// Diagnostic label for queue listings and logs.
    fn describe(&self) -> String;
}

/// Run a future and then every chained continuation, one link at a time.
///
/// Chaining is same-thread and iterative, so arbitrarily long `then` chains
/// cannot overflow the stack. A failing link stops the walk; links after it
/// are left unrun.
pub(crate) fn complete_chain(job: &dyn Runnable) -> Result<(), FutureError> {
    let mut next = job.step()?;
    while let Some(link) = next {
        next = link.step()?;
    }
    Ok(())
}

struct FutureState<T> {
    action: Option<Box<dyn FnOnce() -> T + Send>>,
    result: Option<T>,
    error: Option<FutureError>,
    completed: bool,
    cancelled: bool,
    continuation: Option<Arc<dyn Runnable>>,
    waker: Option<Weak<dyn FutureWaker>>,
    description: Option<String>,
}

/// A one-shot handle to deferred work.
///
/// Exactly one of `{result, error}` is ever produced, and only once.
pub struct Future<T> {
    state: Mutex<FutureState<T>>,
    done: Condvar,
}

impl<T: Send + 'static> Future<T> {
    /// Wrap an action for later execution.
    pub fn new<F>(action: F) -> Arc<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Arc::new(Self {
            state: Mutex::new(FutureState {
                action: Some(Box::new(action)),
                result: None,
                error: None,
                completed: false,
                cancelled: false,
                continuation: None,
                waker: None,
                description: None,
            }),
            done: Condvar::new(),
        })
    }

    /// Whether the future reached a terminal result or failure.
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// The failure captured from the action, if it panicked.
    pub fn get_exception(&self) -> Option<FutureError> {
        self.state.lock().error.clone()
    }

    /// Attach a diagnostic label shown in queue listings and logs.
    pub fn set_description(&self, info: impl Into<String>) {
        self.state.lock().description = Some(info.into());
    }

    /// The diagnostic label, if one was set.
    pub fn description(&self) -> Option<String> {
        self.state.lock().description.clone()
    }

    /// Install a foreign notification target signalled on completion.
    ///
    /// Must be installed before the future can possibly complete for the
    /// notification to be observed. Held weakly: a waker whose owner is
    /// gone is skipped.
    pub fn set_external_waker(&self, waker: Arc<dyn FutureWaker>) {
        self.state.lock().waker = Some(Arc::downgrade(&waker));
    }

    /// Execute the action and every chained continuation.
    ///
    /// The single execution entry point, invoked by exactly one thread per
    /// future. If cancellation was requested before the action started,
    /// this is a no-op returning `Ok`. An action panic is captured into the
    /// future and returned as `Err`; servicing loops match on it, log, and
    /// keep going. Continuations chained after a failing link are not run.
    pub fn complete(&self) -> Result<(), FutureError> {
        complete_chain(self)
    }

    /// Run this future's own action; continuations are left to the caller.
    fn run_step(&self) -> Step {
        let action = {
            let mut state = self.state.lock();
            if state.cancelled || state.completed {
                return Ok(None);
            }
            match state.action.take() {
                Some(action) => action,
                None => return Ok(None),
            }
        };

        // The action runs with no lock held, so a slow task cannot block
        // state reads, cancellation, or new submissions.
        let outcome = catch_unwind(AssertUnwindSafe(action));

        let (continuation, waker, failure) = {
            let mut state = self.state.lock();
            let failure = match outcome {
                Ok(value) => {
                    state.result = Some(value);
                    None
                }
                Err(payload) => {
                    let error = FutureError::from_panic(payload);
                    state.error = Some(error.clone());
                    Some(error)
                }
            };
            state.completed = true;
            self.done.notify_all();
            (state.continuation.take(), state.waker.take(), failure)
        };

        // Foreign notification happens outside our own lock; the waker
        // takes its owner's lock and the two must never nest the other way.
        if let Some(waker) = waker.and_then(|weak| weak.upgrade()) {
            waker.wake();
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(continuation),
        }
    }

    /// Attach a follow-up to run immediately after this future completes.
    ///
    /// Returns the new future, or `None` if completion already happened
    /// (attach failed; the caller must handle it). Replaces any previously
    /// attached continuation.
    pub fn then<U, F>(&self, next: F) -> Option<Arc<Future<U>>>
    where
        U: Send + 'static,
        F: FnOnce() -> U + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.completed {
            return None;
        }
        let follow = Future::new(next);
        let erased: Arc<dyn Runnable> = follow.clone();
        state.continuation = Some(erased);
        Some(follow)
    }

    /// Request cancellation and wake local waiters.
    ///
    /// Returns whether the future had not yet completed, i.e. whether the
    /// request could still have an effect.
    pub fn cancel_future(&self) -> bool {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.done.notify_all();
        !state.completed
    }

    /// Block until the result is available, cancellation, or timeout.
    ///
    /// `None` as the timeout waits indefinitely. The remaining budget is
    /// decremented across spurious wakeups. A wait longer than one second
    /// arms a [`CloseGuard`] that cancels this future on process teardown,
    /// so the caller is woken instead of blocking through shutdown.
    ///
    /// Returns the stored result, or `None` if the future was cancelled or
    /// the timeout elapsed first.
    pub fn get_result(self: &Arc<Self>, timeout: Option<Duration>) -> Option<T>
    where
        T: Clone,
    {
        self.wait_for_result(timeout, None)
    }

    /// Like [`get_result`](Self::get_result), but waits under a guard the
    /// caller already holds instead of arming a fresh one.
    pub fn get_result_with_guard(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        guard: CloseGuard,
    ) -> Option<T>
    where
        T: Clone,
    {
        self.wait_for_result(timeout, Some(guard))
    }

    fn wait_for_result(
        self: &Arc<Self>,
        mut timeout: Option<Duration>,
        mut guard: Option<CloseGuard>,
    ) -> Option<T>
    where
        T: Clone,
    {
        let mut state = self.state.lock();
        while !state.completed && !state.cancelled {
            if let Some(remaining) = timeout {
                if remaining.is_zero() {
                    break;
                }
            }
            if guard.is_none() && timeout.map_or(true, |remaining| remaining > GUARD_THRESHOLD) {
                let name = state
                    .description
                    .clone()
                    .unwrap_or_else(|| "Future wait".to_string());
                let weak = Arc::downgrade(self);
                guard = Some(CloseGuard::with_callback(name, move || {
                    if let Some(future) = weak.upgrade() {
                        future.cancel_future();
                    }
                }));
            }
            match timeout {
                Some(remaining) => {
                    let started = Instant::now();
                    self.done.wait_for(&mut state, remaining);
                    timeout = Some(remaining.saturating_sub(started.elapsed()));
                }
                None => self.done.wait(&mut state),
            }
        }
        // The guard, if armed, is dropped on return, disbanding it.
        state.result.clone()
    }
}

impl<T: Send + 'static> Runnable for Future<T> {
    fn step(&self) -> Step {
        self.run_step()
    }

    fn cancel(&self) -> bool {
        self.cancel_future()
    }

    fn is_completed(&self) -> bool {
        Future::is_completed(self)
    }

    fn is_cancelled(&self) -> bool {
        Future::is_cancelled(self)
    }

    fn describe(&self) -> String {
        match self.description() {
            Some(info) => format!("Future [{info}]"),
            None => "Future".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_complete_stores_result() {
        let future = Future::new(|| 21 * 2);
        assert!(!future.is_completed());

        future.complete().expect("action must not fail");

        assert!(future.is_completed());
        assert_eq!(future.get_result(None), Some(42));
    }

    #[test]
    fn test_get_result_is_idempotent() {
        let future = Future::new(|| String::from("done"));
        future.complete().expect("action must not fail");

        let first = future.get_result(None);
        let second = future.get_result(None);
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("done"));
    }

    #[test]
    fn test_cancel_before_run_suppresses_side_effects() {
        let counter = Arc::new(AtomicUsize::new(0));
        let effect = Arc::clone(&counter);
        let future = Future::new(move || {
            effect.fetch_add(1, Ordering::SeqCst);
        });

        assert!(future.cancel_future());
        future.complete().expect("cancelled complete is a no-op");

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!future.is_completed());
        assert!(future.is_cancelled());
        assert_eq!(future.get_result(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let future = Future::new(|| 7);
        future.complete().expect("action must not fail");

        assert!(!future.cancel_future());
        assert_eq!(future.get_result(None), Some(7));
    }

    #[test]
    fn test_panicking_action_is_captured() {
        let future = Future::new(|| -> i32 { panic!("exploded") });

        let err = future.complete().expect_err("panic must surface as Err");
        assert_eq!(err.to_string(), "task panicked: exploded");

        assert!(future.is_completed());
        assert_eq!(future.get_result(None), None);
        let stored = future.get_exception().expect("exception must be stored");
        assert_eq!(stored.to_string(), err.to_string());
    }

    #[test]
    fn test_then_runs_after_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let first_log = Arc::clone(&log);
        let future = Future::new(move || first_log.lock().push(1));
        let second_log = Arc::clone(&log);
        let follow = future
            .then(move || second_log.lock().push(2))
            .expect("attach must succeed before completion");

        future.complete().expect("chain must not fail");

        assert_eq!(*log.lock(), vec![1, 2]);
        assert!(follow.is_completed());
    }

    #[test]
    fn test_then_after_completion_returns_none() {
        let future = Future::new(|| ());
        future.complete().expect("action must not fail");

        assert!(future.then(|| ()).is_none());
    }

    #[test]
    fn test_long_chain_completes_iteratively() {
        let counter = Arc::new(AtomicUsize::new(0));
        let root_counter = Arc::clone(&counter);
        let root = Future::new(move || {
            root_counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut tail = Arc::clone(&root);
        for _ in 0..2000 {
            let link_counter = Arc::clone(&counter);
            tail = tail
                .then(move || {
                    link_counter.fetch_add(1, Ordering::SeqCst);
                })
                .expect("attach must succeed before completion");
        }

        root.complete().expect("chain must not fail");
        assert_eq!(counter.load(Ordering::SeqCst), 2001);
        assert!(tail.is_completed());
    }

    #[test]
    fn test_failed_link_stops_the_chain() {
        let counter = Arc::new(AtomicUsize::new(0));
        let future = Future::new(|| -> () { panic!("first link dies") });
        let tail_counter = Arc::clone(&counter);
        let tail = future
            .then(move || {
                tail_counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("attach must succeed before completion");

        assert!(future.complete().is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!tail.is_completed());
    }

    #[test]
    fn test_get_result_times_out() {
        let future: Arc<Future<i32>> = Future::new(|| 1);
        let started = Instant::now();
        let result = future.get_result(Some(Duration::from_millis(60)));
        assert_eq!(result, None);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_get_result_wakes_on_cancel() {
        let future: Arc<Future<i32>> = Future::new(|| 1);
        let waiter = Arc::clone(&future);
        let handle = std::thread::spawn(move || waiter.get_result(Some(Duration::from_secs(1))));

        std::thread::sleep(Duration::from_millis(50));
        assert!(future.cancel_future());

        let result = handle.join().expect("waiter thread panicked");
        assert_eq!(result, None);
    }

    #[test]
    fn test_description_round_trip() {
        let future = Future::new(|| ());
        assert_eq!(future.description(), None);
        future.set_description("poll screen");
        assert_eq!(future.description().as_deref(), Some("poll screen"));
    }
}
