//! Session hot path benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tidesync_bench::active_session;
use tidesync_protocol::ProgressDirection;

/// Benchmark accepted progress updates with no waiters.
fn bench_progress_update(c: &mut Criterion) {
    let (_coordinator, session) = active_session();
    let mut transferred = 0u64;

    c.bench_function("progress_update", |b| {
        b.iter(|| {
            transferred += 1;
            let result =
                session.handle_progress_update(ProgressDirection::Upload, transferred, transferred);
            let _ = black_box(result);
        });
    });
}

/// Benchmark a waiter that is satisfied on registration.
fn bench_immediate_completion(c: &mut Criterion) {
    let (_coordinator, session) = active_session();
    session
        .handle_progress_update(ProgressDirection::Download, 100, 100)
        .expect("progress accepted");

    c.bench_function("immediate_completion", |b| {
        b.iter(|| {
            session.wait_for_download_completion(|outcome| {
                black_box(outcome);
            });
        });
    });
}

/// Benchmark a waiter resolved by the next progress update.
fn bench_wait_then_progress(c: &mut Criterion) {
    let (_coordinator, session) = active_session();
    let mut transferred = 0u64;

    c.bench_function("wait_then_progress", |b| {
        b.iter(|| {
            transferred += 1;
            session.wait_for_transferred(ProgressDirection::Download, transferred, |outcome| {
                black_box(outcome);
            });
            let _ = session.handle_progress_update(
                ProgressDirection::Download,
                transferred,
                transferred,
            );
        });
    });
}

criterion_group!(
    benches,
    bench_progress_update,
    bench_immediate_completion,
    bench_wait_then_progress
);
criterion_main!(benches);
