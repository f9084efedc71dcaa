//! Taskmill — thread-based one-shot futures with delay scheduling, bounded
//! worker pools, and completion multiplexing.
//!
//! The crate is a small, auditable, single-process primitive library:
//! - **[`Future`]**: a one-shot observable unit of deferred work, with
//!   result/failure capture, cooperative cancellation, chaining, and
//!   timeout-bounded blocking waits.
//! - **[`Scheduler`]**: a single timer thread firing futures at (or after)
//!   a requested wall-clock delay, ordered by a min-heap on fire time.
//! - **[`WorkerThread`] / [`WorkerThreadPool`]**: background threads
//!   draining a bounded FIFO queue of futures.
//! - **[`FutureMuxer`]**: a registry of in-flight futures letting a caller
//!   block until any or all of them complete.
//! - **[`CloseGuard`]**: scoped registrations that cancel long waits when
//!   process teardown fires.
//!
//! There is no shared event loop, no work-stealing, and no priority
//! scheduling; every component is explicitly constructed, explicitly
//! closed (or closed by `Drop`), and handed to its consumers by the owner.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use taskmill::{FutureMuxer, Scheduler, WorkerThreadPool};
//!
//! let scheduler = Scheduler::new("timers");
//! let pool = WorkerThreadPool::new("workers", 4, Some(64));
//!
//! // Run a probe after a delay.
//! let probe = scheduler.schedule(|| read_sensor(), Duration::from_millis(250));
//!
//! // Fan work out onto the pool and wait for all of it.
//! let muxer = FutureMuxer::new();
//! for shard in 0..4 {
//!     if let Some(future) = pool.push_task(move || process(shard)) {
//!         muxer.add_future(future);
//!     }
//! }
//! let done = muxer.wait_for_all(Some(Duration::from_secs(5)));
//!
//! let reading = probe.get_result(Some(Duration::from_secs(1)));
//! pool.close();
//! scheduler.close();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cleanup;
pub mod error;
pub mod future;
pub mod muxer;
pub mod scheduler;
pub mod worker;

pub use cleanup::{close_all, CloseGuard};
pub use error::FutureError;
pub use future::{Future, FutureWaker};
pub use muxer::FutureMuxer;
pub use scheduler::{ScheduledFuture, Scheduler};
pub use worker::{WorkerThread, WorkerThreadPool};
