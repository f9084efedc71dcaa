//! Worker threads draining a bounded FIFO task queue.
//!
//! A [`WorkerThread`] owns one queue and one executor thread; a
//! [`WorkerThreadPool`] runs several executor loops against the same queue.
//! Submission order into the queue is strictly FIFO; with more than one
//! worker there is no ordering guarantee across completions.
//!
//! Capacity is enforced by rejection, not blocking: `push_task` against a
//! full queue (or a closed worker) returns `None` and the caller decides
//! what to do about it.

use crate::future::{complete_chain, Future, Runnable};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Aggregate deadline `close` grants all executor threads before detaching
/// the stragglers.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

struct WorkerState {
    queue: VecDeque<Arc<dyn Runnable>>,
    running: bool,
}

struct WorkerShared {
    queue_limit: Option<usize>,
    state: Mutex<WorkerState>,
    work: Condvar,
}

/// A single background thread executing queued futures in FIFO order.
pub struct WorkerThread {
    name: String,
    thread_count: usize,
    shared: Arc<WorkerShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerThread {
    /// Start a worker with one executor thread.
    ///
    /// `queue_limit` bounds the number of queued (not yet executing)
    /// tasks; `None` means unbounded.
    pub fn new(name: &str, queue_limit: Option<usize>) -> Self {
        Self::with_threads(name, 1, queue_limit)
    }

    pub(crate) fn with_threads(name: &str, thread_count: usize, queue_limit: Option<usize>) -> Self {
        let shared = Arc::new(WorkerShared {
            queue_limit,
            state: Mutex::new(WorkerState {
                queue: VecDeque::new(),
                running: true,
            }),
            work: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let thread_shared = Arc::clone(&shared);
            let thread_name = format!("{name}-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || Self::run_loop(thread_name, thread_shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            name: name.to_string(),
            thread_count,
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// The name the executor threads were started under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of executor threads.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Queue an action for execution, returning its future.
    ///
    /// Returns `None` if the worker was closed or the queue is at its
    /// limit; rejection is a normal return value, not an error.
    pub fn push_task<T, F>(&self, action: F) -> Option<Arc<Future<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.running {
            return None;
        }
        if let Some(limit) = self.shared.queue_limit {
            if state.queue.len() >= limit {
                drop(state);
                warn!(worker = %self.name, limit, "queue limit reached, rejecting task");
                return None;
            }
        }
        let future = Future::new(action);
        let job: Arc<dyn Runnable> = future.clone();
        trace!(worker = %self.name, task = %job.describe(), "queueing task");
        state.queue.push_back(job);
        self.shared.work.notify_one();
        Some(future)
    }

    /// Number of queued (not yet executing) tasks.
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Descriptions of the queued tasks, in queue order.
    pub fn queue_snapshot(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .queue
            .iter()
            .map(|job| job.describe())
            .collect()
    }

    /// Print the queued task descriptions, in order.
    pub fn print_queue(&self) {
        let snapshot = self.queue_snapshot();
        println!("Queue contents:");
        for (index, description) in snapshot.iter().enumerate() {
            println!("{index}. {description}");
        }
    }

    /// Stop the executor threads.
    ///
    /// Tasks still queued are cancelled, so any caller blocked on their
    /// results wakes with a cancelled outcome instead of hanging. Threads
    /// are joined against one aggregate deadline and detached past it.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            debug!(worker = %self.name, "stopping worker");
            state.running = false;
            self.shared.work.notify_all();
        }

        let deadline = Instant::now() + JOIN_TIMEOUT;
        for handle in self.handles.lock().drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(worker = %self.name, "worker thread did not stop in time");
                // Detached; it will still cancel the queued tasks when its
                // current task finishes.
            }
        }
    }

    /// Executor thread main loop.
    fn run_loop(thread_name: String, shared: Arc<WorkerShared>) {
        let mut state = shared.state.lock();
        while state.running {
            while state.queue.is_empty() && state.running {
                shared.work.wait(&mut state);
            }
            if !state.running {
                break;
            }
            let Some(job) = state.queue.pop_front() else {
                continue;
            };
            drop(state);

            // The task runs with the queue lock released, so a slow task
            // cannot block submissions or shutdown.
            trace!(worker = %thread_name, task = %job.describe(), "executing task");
            if let Err(error) = complete_chain(&*job) {
                warn!(
                    worker = %thread_name,
                    task = %job.describe(),
                    error = %error,
                    "task failed"
                );
            }

            state = shared.state.lock();
        }

        // First loop to exit drains the queue; the rest see it empty.
        let remaining: Vec<Arc<dyn Runnable>> = state.queue.drain(..).collect();
        drop(state);
        if !remaining.is_empty() {
            debug!(
                worker = %thread_name,
                pending = remaining.len(),
                "cancelling queued tasks on shutdown"
            );
        }
        for job in remaining {
            job.cancel();
        }
        debug!(worker = %thread_name, "worker thread exiting");
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.close();
    }
}

/// Several executor threads sharing one FIFO queue.
pub struct WorkerThreadPool {
    worker: WorkerThread,
}

impl WorkerThreadPool {
    /// Start a pool of `pool_size` executor threads.
    ///
    /// A `pool_size` of 0 defaults to the number of CPU cores.
    pub fn new(name: &str, pool_size: usize, queue_limit: Option<usize>) -> Self {
        let count = if pool_size == 0 {
            num_cpus::get()
        } else {
            pool_size
        };
        Self {
            worker: WorkerThread::with_threads(name, count, queue_limit),
        }
    }

    /// The name the executor threads were started under.
    pub fn name(&self) -> &str {
        self.worker.name()
    }

    /// Number of executor threads.
    pub fn pool_size(&self) -> usize {
        self.worker.thread_count()
    }

    /// Queue an action for execution, returning its future.
    ///
    /// Same contract as [`WorkerThread::push_task`].
    pub fn push_task<T, F>(&self, action: F) -> Option<Arc<Future<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.worker.push_task(action)
    }

    /// Number of queued (not yet executing) tasks.
    pub fn queue_len(&self) -> usize {
        self.worker.queue_len()
    }

    /// Descriptions of the queued tasks, in queue order.
    pub fn queue_snapshot(&self) -> Vec<String> {
        self.worker.queue_snapshot()
    }

    /// Print the queued task descriptions, in order.
    pub fn print_queue(&self) {
        self.worker.print_queue()
    }

    /// Stop the executor threads, cancelling queued tasks.
    pub fn close(&self) {
        self.worker.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_worker_executes_task() {
        let worker = WorkerThread::new("test-worker", None);

        let future = worker
            .push_task(|| 21 * 2)
            .expect("push must succeed on a running worker");

        assert_eq!(future.get_result(Some(Duration::from_secs(1))), Some(42));
        worker.close();
    }

    #[test]
    fn test_worker_fifo_order() {
        let worker = WorkerThread::new("test-fifo", None);
        let log = Arc::new(Mutex::new(Vec::new()));

        for value in 0..5 {
            let entry = Arc::clone(&log);
            worker
                .push_task(move || entry.lock().push(value))
                .expect("push must succeed on a running worker");
        }

        thread::sleep(Duration::from_millis(200));
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        worker.close();
    }

    #[test]
    fn test_queue_limit_rejects() {
        let worker = WorkerThread::new("test-limit", Some(2));
        let gate = Arc::new(AtomicUsize::new(0));

        // Occupy the executor so pushed tasks stay queued.
        let blocker_gate = Arc::clone(&gate);
        worker
            .push_task(move || {
                while blocker_gate.load(Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .expect("blocker push must succeed");
        thread::sleep(Duration::from_millis(50));

        assert!(worker.push_task(|| 1).is_some());
        assert!(worker.push_task(|| 2).is_some());
        assert!(worker.push_task(|| 3).is_none());
        assert_eq!(worker.queue_len(), 2);

        gate.store(1, Ordering::SeqCst);
        worker.close();
    }

    #[test]
    fn test_push_after_close_returns_none() {
        let worker = WorkerThread::new("test-closed-push", None);
        worker.close();
        assert!(worker.push_task(|| 1).is_none());
    }

    #[test]
    fn test_close_cancels_queued_tasks() {
        let worker = WorkerThread::new("test-close-cancel", None);
        let counter = Arc::new(AtomicUsize::new(0));

        // Hold the executor long enough for close to land first.
        worker
            .push_task(|| thread::sleep(Duration::from_millis(200)))
            .expect("blocker push must succeed");
        thread::sleep(Duration::from_millis(50));

        let effect = Arc::clone(&counter);
        let queued = worker
            .push_task(move || {
                effect.fetch_add(1, Ordering::SeqCst);
            })
            .expect("queued push must succeed");

        worker.close();

        assert!(queued.is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queued.get_result(Some(Duration::from_millis(100))), None);
    }

    #[test]
    fn test_queue_snapshot_lists_descriptions() {
        let worker = WorkerThread::new("test-snapshot", None);
        let gate = Arc::new(AtomicUsize::new(0));

        let blocker_gate = Arc::clone(&gate);
        worker
            .push_task(move || {
                while blocker_gate.load(Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .expect("blocker push must succeed");
        thread::sleep(Duration::from_millis(50));

        let queued = worker.push_task(|| ()).expect("push must succeed");
        queued.set_description("drain inbox");

        let snapshot = worker.queue_snapshot();
        assert_eq!(snapshot, vec!["Future [drain inbox]".to_string()]);

        gate.store(1, Ordering::SeqCst);
        worker.close();
    }

    #[test]
    fn test_pool_defaults_to_cpu_count() {
        let pool = WorkerThreadPool::new("test-pool-default", 0, None);
        assert_eq!(pool.pool_size(), num_cpus::get());
        pool.close();
    }

    #[test]
    fn test_pool_runs_tasks_on_all_threads() {
        let pool = WorkerThreadPool::new("test-pool", 4, None);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for _ in 0..8 {
            let effect = Arc::clone(&counter);
            let future = pool
                .push_task(move || {
                    effect.fetch_add(1, Ordering::SeqCst);
                })
                .expect("push must succeed on a running pool");
            futures.push(future);
        }

        for future in &futures {
            assert_eq!(future.get_result(Some(Duration::from_secs(1))), Some(()));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        pool.close();
    }
}
