//! Fan work out onto a pool and collect every result through a muxer.
//!
//! Run with: `cargo run --example fan_out`

use std::time::Duration;
use taskmill::{FutureMuxer, WorkerThreadPool};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let pool = WorkerThreadPool::new("fanout", 4, Some(64));
    let muxer = FutureMuxer::new();

    for shard in 0..8_u64 {
        let future = pool
            .push_task(move || {
                std::thread::sleep(Duration::from_millis(20 * shard));
                shard * shard
            })
            .expect("queue rejected task");
        future.set_description(format!("square shard {shard}"));
        muxer.add_future(future);
    }

    let completed = muxer.wait_for_all(Some(Duration::from_secs(5)));
    println!("collected {} results:", completed.len());
    for future in &completed {
        let label = future.description().unwrap_or_default();
        match future.get_result(None) {
            Some(value) => println!("  {label} -> {value}"),
            None => println!("  {label} -> <no result>"),
        }
    }

    pool.close();
}
