//! Delay-based task scheduling on a single timer thread.
//!
//! Instead of polling for due tasks, the timer thread waits on a condvar
//! for exactly as long as the earliest deadline (bounded by an error-safety
//! interval that defends against missed notifications), fires the task
//! outside the lock, and goes back to sleep.

use crate::error::FutureError;
use crate::future::{complete_chain, Future, Runnable};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Upper bound on any single condvar wait in the timer loop; a lost
/// notification delays a task by at most this much.
const ERROR_SAFETY_WAIT: Duration = Duration::from_secs(2);

/// How long `close` waits for the timer thread before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Entry in the timer heap.
struct ScheduledEntry {
    /// When to fire this task.
    run_at: Instant,
    /// Monotonic sequence number, used as the removal key.
    item_id: u64,
    /// The future to run when due.
    job: Arc<dyn Runnable>,
}

// Reverse ordering for min-heap behaviour: earliest fire time first, ties
// broken by submission order.
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.item_id.cmp(&self.item_id))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.item_id == other.item_id
    }
}

impl Eq for ScheduledEntry {}

struct SchedulerState {
    heap: BinaryHeap<ScheduledEntry>,
    next_id: u64,
    running: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    notify: Condvar,
}

/// A future produced by [`Scheduler::schedule`].
///
/// Wraps the underlying [`Future`] together with its absolute fire time and
/// its heap removal key; cancelling it also removes the heap entry so the
/// task never fires at all.
pub struct ScheduledFuture<T> {
    future: Arc<Future<T>>,
    item_id: u64,
    run_at: Instant,
    scheduler: Weak<Scheduler>,
}

impl<T: Send + 'static> ScheduledFuture<T> {
    /// The underlying future.
    pub fn future(&self) -> &Arc<Future<T>> {
        &self.future
    }

    /// The heap removal key.
    pub fn item_id(&self) -> u64 {
        self.item_id
    }

    /// The absolute fire time.
    pub fn run_at(&self) -> Instant {
        self.run_at
    }

    /// Cancel the future and remove its entry from the scheduler heap.
    ///
    /// Returns whether the future had not yet completed.
    pub fn cancel(&self) -> bool {
        let had_effect = self.future.cancel_future();
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.cancel_future_by_id(self.item_id);
        }
        had_effect
    }

    /// Whether the future reached a terminal result or failure.
    pub fn is_completed(&self) -> bool {
        self.future.is_completed()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.future.is_cancelled()
    }

    /// The failure captured from the action, if it panicked.
    pub fn get_exception(&self) -> Option<FutureError> {
        self.future.get_exception()
    }

    /// Block until the result is available, cancellation, or timeout.
    pub fn get_result(&self, timeout: Option<Duration>) -> Option<T>
    where
        T: Clone,
    {
        self.future.get_result(timeout)
    }
}

/// Fires futures at (or after) a requested wall-clock delay.
///
/// One dedicated thread services the whole scheduler instance; tasks run on
/// that thread, in non-decreasing `run_at` order, with the scheduler lock
/// released.
pub struct Scheduler {
    name: String,
    shared: Arc<SchedulerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler and start its timer thread.
    pub fn new(name: &str) -> Arc<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                next_id: 1,
                running: true,
            }),
            notify: Condvar::new(),
        });

        let loop_shared = Arc::clone(&shared);
        let loop_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run_loop(loop_name, loop_shared))
            .expect("failed to spawn scheduler thread");

        Arc::new(Self {
            name: name.to_string(),
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The name the timer thread was started under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an action to fire once `delay` has elapsed.
    ///
    /// On a scheduler that was already closed, the returned future is
    /// immediately cancelled instead of being queued onto a dead heap.
    pub fn schedule<T, F>(self: &Arc<Self>, action: F, delay: Duration) -> ScheduledFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let future = Future::new(action);
        let job: Arc<dyn Runnable> = future.clone();
        let run_at = Instant::now() + delay;

        let mut state = self.shared.state.lock();
        let item_id = state.next_id;
        state.next_id += 1;
        if state.running {
            state.heap.push(ScheduledEntry {
                run_at,
                item_id,
                job,
            });
            self.shared.notify.notify_one();
            drop(state);
        } else {
            drop(state);
            warn!(scheduler = %self.name, "schedule on a stopped scheduler, task cancelled");
            future.cancel_future();
        }

        ScheduledFuture {
            future,
            item_id,
            run_at,
            scheduler: Arc::downgrade(self),
        }
    }

    /// Remove a pending entry by its id, cancelling its future.
    ///
    /// Linear scan over the heap; fine for the tens of pending timers this
    /// is built for. Returns whether the entry was found.
    pub fn cancel_future_by_id(&self, item_id: u64) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let mut found: Option<Arc<dyn Runnable>> = None;
            state.heap.retain(|entry| {
                if entry.item_id == item_id {
                    found = Some(Arc::clone(&entry.job));
                    false
                } else {
                    true
                }
            });
            found
        };
        match removed {
            Some(job) => {
                // Cancel outside the lock so a waiter woken by it cannot
                // contend with us.
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of entries still waiting to fire.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stop the timer thread.
    ///
    /// Pending entries are cancelled, not fired, so waiters wake with a
    /// cancelled outcome instead of hanging. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            debug!(scheduler = %self.name, "stopping scheduler");
            state.running = false;
            self.shared.notify.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(scheduler = %self.name, "scheduler thread did not stop in time");
                // Dropping the handle detaches the thread; it will still
                // cancel the pending entries when it exits.
            }
        }
    }

    /// Timer thread main loop.
    fn run_loop(name: String, shared: Arc<SchedulerShared>) {
        loop {
            let job = {
                let mut state = shared.state.lock();
                loop {
                    if !state.running {
                        let remaining: Vec<ScheduledEntry> = state.heap.drain().collect();
                        drop(state);
                        if !remaining.is_empty() {
                            debug!(
                                scheduler = %name,
                                pending = remaining.len(),
                                "cancelling pending timers on shutdown"
                            );
                        }
                        for entry in remaining {
                            entry.job.cancel();
                        }
                        debug!(scheduler = %name, "scheduler thread exiting");
                        return;
                    }

                    let now = Instant::now();
                    let wait = match state.heap.peek() {
                        Some(entry) if entry.run_at <= now => None,
                        Some(entry) => Some((entry.run_at - now).min(ERROR_SAFETY_WAIT)),
                        None => Some(ERROR_SAFETY_WAIT),
                    };
                    match wait {
                        None => {
                            if let Some(entry) = state.heap.pop() {
                                break entry.job;
                            }
                        }
                        Some(duration) => {
                            shared.notify.wait_for(&mut state, duration);
                        }
                    }
                }
            };

            // The task runs with the scheduler lock released.
            trace!(scheduler = %name, task = %job.describe(), "firing scheduled task");
            if let Err(error) = complete_chain(&*job) {
                warn!(scheduler = %name, error = %error, "scheduled task failed");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}
