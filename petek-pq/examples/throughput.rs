//! Insert/delete-min throughput driver.
//!
//! Takes the number of worker threads as its one positional argument,
//! inserts a batch of unique random keys in parallel, then deletes the
//! minimum in parallel, and reports both phases in ops/µs.
//!
//!     cargo run --release --example throughput -- 8

use petek_pq::PriorityQueue;
use std::sync::Arc;
use std::time::Instant;

const TOTAL_OPS: usize = 1_000_000;

/// Finalizer-style mixer: turns an index into a unique random-looking key.
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

fn parallel_for(threads: usize, total: usize, f: impl Fn(usize) + Send + Sync + 'static) {
    let f = Arc::new(f);
    let per_thread = total / threads;
    let mut handles = Vec::new();
    for t in 0..threads {
        let f = f.clone();
        let start = t * per_thread;
        let end = if t + 1 == threads { total } else { start + per_thread };
        handles.push(std::thread::spawn(move || {
            for i in start..end {
                f(i);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

fn main() {
    let threads: usize = std::env::args()
        .nth(1)
        .expect("usage: throughput <num_threads>")
        .parse()
        .expect("thread count must be an integer");
    assert!(threads >= 1, "thread count must be >= 1");

    println!("Benchmark: TOTAL_OPS={TOTAL_OPS}, NUM_THREADS={threads}");

    let pq = Arc::new(PriorityQueue::new(10));

    // Random-looking keys from a bijective mixer, generated up front (not
    // timed). The modulo keeps them off the sentinel values.
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
        ^ 0x9e37_79b9_7f4a_7c15;
    let keys: Arc<Vec<u64>> = Arc::new(
        (0..TOTAL_OPS)
            .map(|i| mix64(seed ^ i as u64) % (u64::MAX - 2) + 1)
            .collect(),
    );

    // Insert phase.
    let start = Instant::now();
    {
        let pq = pq.clone();
        let keys = keys.clone();
        parallel_for(threads, TOTAL_OPS, move |i| {
            let k = keys[i];
            pq.insert(k, k as usize);
        });
    }
    let insert_us = start.elapsed().as_micros().max(1);
    println!(
        "\tInsert took {insert_us} us, throughput = {:.3} ops/us",
        TOTAL_OPS as f64 / insert_us as f64
    );

    // Delete-min phase.
    let start = Instant::now();
    {
        let pq = pq.clone();
        parallel_for(threads, TOTAL_OPS, move |_| {
            let _ = pq.delete_min();
        });
    }
    let delete_us = start.elapsed().as_micros().max(1);
    println!(
        "\tDeleteMin took {delete_us} us, throughput = {:.3} ops/us",
        TOTAL_OPS as f64 / delete_us as f64
    );

    println!("success");
}
