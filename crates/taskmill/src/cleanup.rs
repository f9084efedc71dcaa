//! Process-teardown guards.
//!
//! A [`CloseGuard`] registers a cleanup callback in a process-wide registry.
//! When the application decides to tear down (by calling [`close_all`]),
//! every live guard is closed and its callback fires exactly once. Guards
//! that are dropped or explicitly disbanded before teardown never fire.
//!
//! `Future::get_result` uses a guard to avoid blocking forever through a
//! shutdown: a long wait arms a guard that cancels the future (and thereby
//! wakes the waiter) if teardown happens mid-wait.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

struct GuardState {
    closed: bool,
    callback: Option<Callback>,
}

struct GuardInner {
    name: String,
    state: Mutex<GuardState>,
    closed_signal: Condvar,
}

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(1);

static REGISTRY: Lazy<Mutex<HashMap<u64, Arc<GuardInner>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A scoped registration against process teardown.
///
/// Dropping the guard deregisters it without firing the callback, so a
/// guard held across a bounded wait arms the callback for exactly the
/// duration of that wait.
pub struct CloseGuard {
    id: u64,
    inner: Arc<GuardInner>,
}

impl CloseGuard {
    /// Register a guard with no callback.
    ///
    /// Useful purely for its [`sleep`](Self::sleep) and
    /// [`meet_condition`](Self::meet_condition) waits, which end early when
    /// teardown fires.
    pub fn new(name: impl Into<String>) -> Self {
        Self::register(name.into(), None)
    }

    /// Register a guard whose callback fires at most once, on teardown.
    pub fn with_callback(name: impl Into<String>, callback: impl FnOnce() + Send + 'static) -> Self {
        Self::register(name.into(), Some(Box::new(callback)))
    }

    fn register(name: String, callback: Option<Callback>) -> Self {
        let id = NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(GuardInner {
            name,
            state: Mutex::new(GuardState {
                closed: false,
                callback,
            }),
            closed_signal: Condvar::new(),
        });
        REGISTRY.lock().insert(id, Arc::clone(&inner));
        Self { id, inner }
    }

    /// The name this guard was registered under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether teardown has already closed this guard.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Deregister without firing the callback.
    pub fn disband(self) {
        drop(self);
    }

    /// Sleep up to `timeout`, waking early if teardown closes the guard.
    ///
    /// Returns whether the guard was closed.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.closed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.inner
                .closed_signal
                .wait_for(&mut state, deadline - now);
        }
        state.closed
    }

    /// Poll `rule` every `period` until it holds, the timeout budget runs
    /// out, or teardown closes the guard.
    ///
    /// Returns `true` only if the rule was met before either of the other
    /// two outcomes.
    pub fn meet_condition(
        &self,
        rule: impl Fn() -> bool,
        mut timeout: Option<Duration>,
        period: Duration,
    ) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            if rule() {
                return true;
            }
            let wait = match timeout {
                Some(remaining) if remaining.is_zero() => return false,
                Some(remaining) => remaining.min(period),
                None => period,
            };
            let started = Instant::now();
            if self.sleep(wait) {
                return false;
            }
            if let Some(remaining) = timeout {
                let remaining = remaining.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return false;
                }
                timeout = Some(remaining);
            }
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        REGISTRY.lock().remove(&self.id);
    }
}

fn fire(inner: &GuardInner) {
    let callback = {
        let mut state = inner.state.lock();
        state.closed = true;
        inner.closed_signal.notify_all();
        state.callback.take()
    };
    if let Some(callback) = callback {
        debug!(guard = %inner.name, "firing close guard");
        callback();
    }
}

/// Close every registered guard and fire its callback.
///
/// Guards are drained from the registry under the lock, but callbacks run
/// with the lock released, so a callback may itself create or drop guards.
/// The registry stays usable afterwards; this is a teardown signal, not a
/// one-way latch.
pub fn close_all() {
    let guards: Vec<Arc<GuardInner>> = {
        let mut registry = REGISTRY.lock();
        registry.drain().map(|(_, inner)| inner).collect()
    };
    if guards.is_empty() {
        return;
    }
    debug!(count = guards.len(), "running close guards");
    for inner in guards {
        fire(&inner);
    }
}
