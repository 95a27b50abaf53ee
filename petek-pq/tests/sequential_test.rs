//! Single-threaded behavior of the priority queue.

use petek_pq::PriorityQueue;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[test]
fn test_delete_min_orders_keys() {
    let pq = PriorityQueue::new(10);
    pq.insert(5, 5);
    pq.insert(3, 3);
    pq.insert(7, 7);

    assert_eq!(pq.delete_min(), Some(3));
    assert_eq!(pq.delete_min(), Some(5));
    assert_eq!(pq.delete_min(), Some(7));
    assert_eq!(pq.delete_min(), None);
}

#[test]
fn test_duplicate_keys_are_kept() {
    let pq = PriorityQueue::new(10);
    pq.insert(10, 100);
    pq.insert(10, 200);

    let first = pq.delete_min().expect("first duplicate");
    let second = pq.delete_min().expect("second duplicate");
    assert_eq!(pq.delete_min(), None);

    let mut got = [first, second];
    got.sort_unstable();
    assert_eq!(got, [100, 200]);
}

#[test]
fn test_empty_queue_returns_none() {
    let pq = PriorityQueue::new(10);
    assert_eq!(pq.delete_min(), None);
    // Still empty on a second attempt.
    assert_eq!(pq.delete_min(), None);
}

#[test]
fn test_insert_is_immediately_visible() {
    let pq = PriorityQueue::new(10);
    for i in 1..=100u64 {
        pq.insert(i, i as usize);
        assert_eq!(pq.delete_min(), Some(i as usize));
    }
    assert_eq!(pq.delete_min(), None);
}

#[test]
fn test_drain_is_sorted() {
    let mut rng = SmallRng::seed_from_u64(0xBEE5);
    let pq = PriorityQueue::new(10);

    let mut keys = Vec::new();
    for _ in 0..2000 {
        let key = rng.gen_range(1..u64::MAX - 1);
        keys.push(key);
        pq.insert(key, key as usize);
    }
    keys.sort_unstable();

    let mut drained = Vec::new();
    while let Some(value) = pq.delete_min() {
        drained.push(value as u64);
    }
    assert_eq!(drained, keys);
    assert_eq!(pq.delete_min(), None);
}

#[test]
fn test_exact_count_then_empty() {
    let pq = PriorityQueue::new(10);
    let n = 500u64;
    for i in 1..=n {
        pq.insert(i * 3, i as usize);
    }
    for _ in 0..n {
        assert!(pq.delete_min().is_some());
    }
    // The (n+1)-th call finds nothing.
    assert_eq!(pq.delete_min(), None);
}

#[test]
fn test_tiny_max_offset_restructures() {
    // max_offset 0 forces a restructure attempt on every delete, so the
    // whole physical-unlink path runs even single-threaded.
    for max_offset in [0usize, 1, 2] {
        let pq = PriorityQueue::new(max_offset);
        for i in 1..=1000u64 {
            pq.insert(i, i as usize);
        }
        for i in 1..=1000u64 {
            assert_eq!(pq.delete_min(), Some(i as usize));
        }
        assert_eq!(pq.delete_min(), None);

        // Refill after heavy restructuring still works.
        for i in 1..=100u64 {
            pq.insert(i * 7, i as usize);
        }
        for i in 1..=100u64 {
            assert_eq!(pq.delete_min(), Some(i as usize));
        }
        assert_eq!(pq.delete_min(), None);
    }
}

#[test]
fn test_interleaved_insert_delete() {
    let mut rng = SmallRng::seed_from_u64(42);
    let pq = PriorityQueue::new(4);
    let mut live = std::collections::BTreeMap::<u64, usize>::new();

    for round in 0..5000 {
        if rng.gen_bool(0.6) || live.is_empty() {
            let key = rng.gen_range(1..1 << 40);
            if live.contains_key(&key) {
                continue; // keep the model simple: unique keys
            }
            live.insert(key, round);
            pq.insert(key, round);
        } else {
            let (&min_key, &expected) = live.iter().next().unwrap();
            assert_eq!(pq.delete_min(), Some(expected));
            live.remove(&min_key);
        }
    }

    while let Some(value) = pq.delete_min() {
        let (&min_key, &expected) = live.iter().next().unwrap();
        assert_eq!(value, expected);
        live.remove(&min_key);
    }
    assert!(live.is_empty());
}
