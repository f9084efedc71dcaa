//! Waiting across many in-flight futures.
//!
//! A [`FutureMuxer`] tracks futures produced anywhere (scheduler, worker,
//! or direct construction) and lets one caller block until *any* or *all*
//! of them complete, with a timeout budget decremented across wakeups.
//!
//! Registration installs the muxer as each future's external notification
//! target, so a completion on any servicing thread wakes the muxer's
//! waiters.

use crate::future::{Future, FutureWaker};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct MuxerState<T> {
    futures: Vec<Arc<Future<T>>>,
    closed: bool,
}

struct MuxerShared<T> {
    state: Mutex<MuxerState<T>>,
    completion: Condvar,
}

impl<T: Send + 'static> FutureWaker for MuxerShared<T> {
    fn wake(&self) {
        // Taking the state lock orders the wake after any in-progress scan,
        // so a waiter cannot miss the completion it is about to sleep on.
        let _state = self.state.lock();
        self.completion.notify_all();
    }
}

/// A registry of in-flight futures supporting any/all completion waits.
pub struct FutureMuxer<T> {
    shared: Arc<MuxerShared<T>>,
}

impl<T: Send + 'static> FutureMuxer<T> {
    /// Create an empty muxer.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MuxerShared {
                state: Mutex::new(MuxerState {
                    futures: Vec::new(),
                    closed: false,
                }),
                completion: Condvar::new(),
            }),
        }
    }

    /// Track a future and install this muxer as its notification target.
    ///
    /// A future that already completed is picked up by the next `pop`: the
    /// registration itself wakes the waiters.
    pub fn add_future(&self, future: Arc<Future<T>>) {
        let waker: Arc<dyn FutureWaker> = self.shared.clone();
        let mut state = self.shared.state.lock();
        future.set_external_waker(waker);
        state.futures.push(future);
        self.shared.completion.notify_all();
    }

    /// Remove and return the first tracked future that has completed.
    pub fn pop_any_completed_future(&self) -> Option<Arc<Future<T>>> {
        let mut state = self.shared.state.lock();
        Self::pop_completed_locked(&mut state)
    }

    /// Remove and return every tracked future that has completed.
    pub fn pop_completed_futures(&self) -> Vec<Arc<Future<T>>> {
        let mut state = self.shared.state.lock();
        let mut completed = Vec::new();
        let mut index = 0;
        while index < state.futures.len() {
            if state.futures[index].is_completed() {
                completed.push(state.futures.remove(index));
            } else {
                index += 1;
            }
        }
        completed
    }

    /// Block until some tracked future completes, then remove and return it.
    ///
    /// Returns immediately if a completed future is already present.
    /// Returns `None` once the timeout budget is exhausted or the muxer is
    /// closed.
    pub fn wait_and_pop(&self, mut timeout: Option<Duration>) -> Option<Arc<Future<T>>> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(future) = Self::pop_completed_locked(&mut state) {
                return Some(future);
            }
            if state.closed {
                return None;
            }
            match timeout {
                Some(remaining) if remaining.is_zero() => return None,
                Some(remaining) => {
                    let started = Instant::now();
                    self.shared.completion.wait_for(&mut state, remaining);
                    timeout = Some(remaining.saturating_sub(started.elapsed()));
                }
                None => self.shared.completion.wait(&mut state),
            }
        }
    }

    /// Pop completed futures until the tracked list is empty, the timeout
    /// budget runs out, or the muxer is closed.
    ///
    /// Returns the completed futures collected within the budget.
    pub fn wait_for_all(&self, mut timeout: Option<Duration>) -> Vec<Arc<Future<T>>> {
        let mut completed = Vec::new();
        loop {
            if self.shared.state.lock().futures.is_empty() {
                break;
            }
            let started = Instant::now();
            match self.wait_and_pop(timeout) {
                Some(future) => completed.push(future),
                None => break,
            }
            if let Some(remaining) = timeout {
                timeout = Some(remaining.saturating_sub(started.elapsed()));
            }
        }
        completed
    }

    /// Number of futures still tracked.
    pub fn tracked_count(&self) -> usize {
        self.shared.state.lock().futures.len()
    }

    /// Whether the muxer was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close the muxer and wake all waiters, so pending waits terminate
    /// instead of hanging after teardown. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.shared.completion.notify_all();
    }

    fn pop_completed_locked(state: &mut MuxerState<T>) -> Option<Arc<Future<T>>> {
        let index = state.futures.iter().position(|f| f.is_completed())?;
        Some(state.futures.remove(index))
    }
}

impl<T: Send + 'static> Default for FutureMuxer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FutureMuxer<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        self.shared.completion.notify_all();
    }
}
