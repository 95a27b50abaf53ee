//! Throughput benchmarks for petek epoch reclamation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use petek::{alloc_chunk, defer_free, pin, register_allocator, AllocatorId};
use std::sync::OnceLock;

fn bench_allocator() -> AllocatorId {
    static ID: OnceLock<AllocatorId> = OnceLock::new();
    *ID.get_or_init(|| register_allocator(64, None))
}

fn bench_pin_unpin(c: &mut Criterion) {
    let mut group = c.benchmark_group("pin_unpin");

    group.bench_function("single_thread", |b| {
        b.iter(|| {
            let guard = pin();
            black_box(&guard);
        });
    });

    group.bench_function("nested", |b| {
        let _outer = pin();
        b.iter(|| {
            let guard = pin();
            black_box(&guard);
        });
    });

    group.finish();
}

fn bench_alloc_defer(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_defer");
    let id = bench_allocator();

    for batch in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            b.iter(|| {
                let guard = pin();
                for _ in 0..batch {
                    let chunk = alloc_chunk(id);
                    black_box(chunk);
                    // SAFETY: freshly allocated, never published.
                    unsafe { defer_free(id, chunk) };
                }
                drop(guard);
                petek::flush();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pin_unpin, bench_alloc_defer);
criterion_main!(benches);
