//! Throughput benchmarks for the skip-list priority queue.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use petek_pq::PriorityQueue;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1_000usize, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut rng = SmallRng::seed_from_u64(1);
            b.iter(|| {
                let pq = PriorityQueue::new(10);
                for i in 0..size {
                    pq.insert(rng.gen_range(1..1u64 << 40), i);
                }
                black_box(&pq);
            });
        });
    }

    group.finish();
}

fn bench_delete_min(c: &mut Criterion) {
    let mut group = c.benchmark_group("delete_min");

    for size in [1_000usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut rng = SmallRng::seed_from_u64(2);
            b.iter_batched(
                || {
                    let pq = PriorityQueue::new(10);
                    for i in 0..size {
                        pq.insert(rng.gen_range(1..1u64 << 40), i);
                    }
                    pq
                },
                |pq| {
                    while let Some(v) = pq.delete_min() {
                        black_box(v);
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_mixed_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.sample_size(10);

    for threads in [2usize, 4, 8].iter() {
        const OPS: usize = 10_000;
        group.throughput(Throughput::Elements((threads * OPS) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            threads,
            |b, &threads| {
                b.iter(|| {
                    let pq = Arc::new(PriorityQueue::new(10));
                    let mut handles = Vec::new();
                    for t in 0..threads {
                        let pq = pq.clone();
                        handles.push(thread::spawn(move || {
                            let mut rng = SmallRng::seed_from_u64(t as u64);
                            for i in 0..OPS {
                                if i % 2 == 0 {
                                    pq.insert(rng.gen_range(1..1u64 << 40), i);
                                } else {
                                    black_box(pq.delete_min());
                                }
                            }
                        }));
                    }
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_delete_min, bench_mixed_threads);
criterion_main!(benches);
