//! Concurrent stress tests for the priority queue.
//!
//! These push insert/delete-min interleavings hard enough that a marking,
//! restructuring, or reclamation bug shows up as a lost value, a double
//! delivery, or a crash.

use petek_pq::PriorityQueue;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn test_disjoint_ranges_union() {
    // Four threads insert disjoint key ranges, then everybody drains.
    // The union of returned values must be exactly the inserted set.
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 1000;

    let pq = Arc::new(PriorityQueue::new(10));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let pq = pq.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for k in (t * 1000 + 1)..=(t * 1000 + PER_THREAD) {
                pq.insert(k, k as usize);
            }
            barrier.wait();
            let mut mine = Vec::new();
            while let Some(v) = pq.delete_min() {
                mine.push(v);
            }
            mine
        }));
    }

    let mut all = HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        let mine = handle.join().unwrap();
        total += mine.len();
        for v in mine {
            assert!(all.insert(v), "value {v} delivered twice");
        }
    }

    assert_eq!(total, (THREADS * PER_THREAD) as usize);
    let expected: HashSet<usize> = (1..=(THREADS * PER_THREAD) as usize).collect();
    assert_eq!(all, expected);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_mixed_workload_conserves_values() {
    // Eight threads alternate random inserts and delete-mins. Afterwards:
    // every delivered value was inserted exactly once, nothing is
    // delivered twice, and a sequential drain of the leftovers comes out
    // in non-decreasing key order.
    const THREADS: usize = 8;
    const OPS: usize = 20_000;

    let pq = Arc::new(PriorityQueue::new(10));
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let pq = pq.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(0xC0FFEE ^ t as u64);
            let mut inserted = HashMap::new(); // value -> key
            let mut deleted = Vec::new();
            barrier.wait();
            for i in 0..OPS {
                if i % 2 == 0 {
                    let key = rng.gen_range(1..1u64 << 40);
                    let value = t * OPS + i; // unique per op
                    inserted.insert(value, key);
                    pq.insert(key, value);
                } else if let Some(v) = pq.delete_min() {
                    deleted.push(v);
                }
            }
            (inserted, deleted)
        }));
    }

    let mut inserted = HashMap::new();
    let mut delivered = HashSet::new();
    for handle in handles {
        let (ins, del) = handle.join().unwrap();
        for (v, k) in ins {
            inserted.insert(v, k);
        }
        for v in del {
            assert!(delivered.insert(v), "value {v} delivered twice");
        }
    }
    for v in &delivered {
        assert!(inserted.contains_key(v), "value {v} was never inserted");
    }

    // Sequential drain: non-decreasing keys, and conservation overall.
    let concurrent_deliveries = delivered.len();
    let mut last_key = 0u64;
    let mut drained = 0usize;
    while let Some(v) = pq.delete_min() {
        let key = *inserted.get(&v).expect("drained value was never inserted");
        assert!(
            key >= last_key,
            "drain went backwards: key {key} after {last_key}"
        );
        last_key = key;
        assert!(delivered.insert(v), "value {v} delivered twice");
        drained += 1;
    }
    assert_eq!(concurrent_deliveries + drained, inserted.len());
    assert_eq!(delivered.len(), inserted.len());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_churn_with_aggressive_restructure() {
    // Tiny max_offset maximizes head contention and physical unlinking
    // while inserts race it. Reclamation bugs crash or corrupt here.
    const THREADS: usize = 4;
    const OPS: usize = 30_000;

    let pq = Arc::new(PriorityQueue::new(1));
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let pq = pq.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(0x5EED ^ t as u64);
            let mut balance = 0isize;
            barrier.wait();
            for _ in 0..OPS {
                if rng.gen_bool(0.5) {
                    pq.insert(rng.gen_range(1..1u64 << 20), t);
                    balance += 1;
                } else if pq.delete_min().is_some() {
                    balance -= 1;
                }
            }
            balance
        }));
    }

    let mut balance = 0isize;
    for handle in handles {
        balance += handle.join().unwrap();
    }

    // Whatever the interleaving, the leftovers equal inserts minus
    // deliveries.
    let mut leftover = 0isize;
    while pq.delete_min().is_some() {
        leftover += 1;
    }
    assert_eq!(leftover, balance);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_producers_and_consumers() {
    // Skewed roles: half the threads only insert, half only delete until
    // they have seen their share. Nothing may be lost.
    const PAIRS: usize = 3;
    const PER_PRODUCER: usize = 10_000;

    let pq = Arc::new(PriorityQueue::new(10));
    let barrier = Arc::new(Barrier::new(PAIRS * 2));

    let mut handles = Vec::new();
    for t in 0..PAIRS {
        let pq = pq.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut rng = SmallRng::seed_from_u64(t as u64);
            for i in 0..PER_PRODUCER {
                let key = rng.gen_range(1..1u64 << 30);
                pq.insert(key, t * PER_PRODUCER + i);
            }
            Vec::new()
        }));
    }
    for _ in 0..PAIRS {
        let pq = pq.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut got = Vec::with_capacity(PER_PRODUCER);
            while got.len() < PER_PRODUCER {
                if let Some(v) = pq.delete_min() {
                    got.push(v);
                } else {
                    std::hint::spin_loop();
                }
            }
            got
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for v in handle.join().unwrap() {
            assert!(seen.insert(v), "value {v} delivered twice");
        }
    }
    assert_eq!(seen.len(), PAIRS * PER_PRODUCER);
    assert_eq!(pq.delete_min(), None);
}
