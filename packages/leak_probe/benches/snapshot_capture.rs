//! Benchmarks to measure the overhead of `leak_probe` itself.
//!
//! Compares allocations made with and without an active tracking session and measures how
//! long capturing snapshots and probing an operation that does nothing takes.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::convert::Infallible;
use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use leak_probe::{Allocator, GroupBy, TrackerSession, TrackingScope};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("leak_probe_overhead");

    // Baseline measurement - no tracking at all
    group.bench_function("allocation_untracked", |b| {
        b.iter(|| {
            black_box(Box::new(black_box(42_u64)));
        });
    });

    {
        let session = TrackerSession::builder()
            .scope(TrackingScope::Thread)
            .enable()
            .unwrap();

        group.bench_function("allocation_tracked", |b| {
            b.iter(|| {
                black_box(Box::new(black_box(42_u64)));
            });
        });

        // Some long-lived allocations for the snapshot to group.
        let retained: Vec<Box<[u8; 64]>> = (0..1000).map(|_| Box::new([0_u8; 64])).collect();

        group.bench_function("capture_snapshot", |b| {
            b.iter(|| {
                black_box(session.capture_snapshot().unwrap());
            });
        });

        group.bench_function("run_probe_empty", |b| {
            b.iter(|| {
                black_box(
                    session
                        .run_probe_grouped_by(|()| Ok::<_, Infallible>(()), (), GroupBy::Line)
                        .unwrap(),
                );
            });
        });

        drop(retained);
    }

    group.finish();
}
