//! Completion registry benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tidesync_bench::random_targets;
use tidesync_protocol::{ProgressDirection, Status};
use tidesync_session::{CompletionOutcome, CompletionRegistry, CompletionWaiter};

fn filled_registry(targets: &[u64]) -> CompletionRegistry {
    let mut registry = CompletionRegistry::new();
    for &target in targets {
        registry.register(CompletionWaiter::new(
            ProgressDirection::Download,
            target,
            |outcome| {
                black_box(outcome);
            },
        ));
    }
    registry
}

/// Benchmark registering waiters.
fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("register");

    for count in [100usize, 1_000, 10_000] {
        let targets = random_targets(count, 1_000_000);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &targets, |b, targets| {
            b.iter(|| black_box(filled_registry(targets)));
        });
    }

    group.finish();
}

/// Benchmark resolving waiters with progress updates.
fn bench_on_progress(c: &mut Criterion) {
    let mut group = c.benchmark_group("on_progress");

    for count in [100usize, 1_000, 10_000] {
        let targets = random_targets(count, 1_000_000);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("ten_steps", count), &targets, |b, targets| {
            b.iter_batched(
                || filled_registry(targets),
                |mut registry| {
                    for step in 1..=10u64 {
                        registry
                            .on_progress(ProgressDirection::Download, step * 100_000)
                            .fire();
                    }
                    black_box(registry.len())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark flushing every waiter.
fn bench_flush_all(c: &mut Criterion) {
    let targets = random_targets(10_000, 1_000_000);
    c.bench_function("flush_all_10000", |b| {
        b.iter_batched(
            || filled_registry(&targets),
            |mut registry| {
                registry
                    .flush_all(CompletionOutcome::Aborted(Status::aborted("bench")))
                    .fire();
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_register, bench_on_progress, bench_flush_all);
criterion_main!(benches);
