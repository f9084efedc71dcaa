//! Schedule a flaky probe with retries backed off through the scheduler.
//!
//! Run with: `cargo run --example delayed_retry`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmill::Scheduler;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let scheduler = Scheduler::new("retry-timers");
    let attempts = Arc::new(AtomicUsize::new(0));

    // The probe fails twice before it succeeds; each retry is re-submitted
    // with a doubled delay. Retry policy lives in the caller, not the core.
    let mut delay = Duration::from_millis(50);
    let result = loop {
        let counter = Arc::clone(&attempts);
        let probe = scheduler.schedule(
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    None
                } else {
                    Some(attempt)
                }
            },
            delay,
        );
        probe
            .future()
            .set_description(format!("probe after {delay:?}"));

        match probe.get_result(Some(Duration::from_secs(2))).flatten() {
            Some(attempt) => break Some(attempt),
            None if attempts.load(Ordering::SeqCst) >= 5 => break None,
            None => delay *= 2,
        }
    };

    match result {
        Some(attempt) => println!("probe succeeded on attempt {attempt}"),
        None => println!("probe never succeeded"),
    }

    scheduler.close();
}
