//! Stress tests for TideSync sessions.
//!
//! These runs hammer one session from several threads and check that
//! every completion waiter fires exactly once.

use crate::fixtures::TestHarness;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tidesync_protocol::{ErrorCode, ProgressDirection, SessionErrorInfo, Status};
use tidesync_session::CompletionOutcome;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Operations the session accepted.
    pub successful_ops: usize,
    /// Operations the session rejected, such as racing progress updates.
    pub failed_ops: usize,
    /// Waiters registered during the run.
    pub waiters_registered: usize,
    /// Callback invocations observed.
    pub waiters_fired: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(
        successful: usize,
        failed: usize,
        waiters_registered: usize,
        waiters_fired: usize,
        duration: Duration,
    ) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            waiters_registered,
            waiters_fired,
            duration,
            ops_per_second,
        }
    }

    /// Returns true if every registered waiter fired exactly once.
    pub fn exactly_once(&self) -> bool {
        self.waiters_registered == self.waiters_fired
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Waiters registered: {}", self.waiters_registered);
        println!("Waiters fired: {}", self.waiters_fired);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per worker thread.
    pub operations: usize,
    /// Number of worker threads.
    pub threads: usize,
    /// Largest waiter target in bytes.
    pub max_target: u64,
    /// Inject transient errors and suspend/resume cycles.
    pub inject_faults: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            threads: 4,
            max_target: 10_000,
            inject_faults: true,
        }
    }
}

/// Runs worker threads that register waiters and push progress while a
/// fault thread cycles the session, then force-closes the session and
/// counts callback invocations.
pub fn stress_concurrent_completions(config: &StressConfig) -> StressTestResult {
    let harness = TestHarness::new();
    harness.tokens.set_auto_reply(true);
    let session = harness.active_session("/stress");

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let registered = Arc::new(AtomicUsize::new(0));
    let fired = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();

    let mut handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let session = Arc::clone(&session);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let registered = Arc::clone(&registered);
            let fired = Arc::clone(&fired);
            let operations = config.operations;
            let max_target = config.max_target.max(1);

            thread::spawn(move || {
                for i in 0..operations {
                    let direction = if (t + i) % 2 == 0 {
                        ProgressDirection::Upload
                    } else {
                        ProgressDirection::Download
                    };

                    if i % 2 == 0 {
                        let target = (i as u64 * 7 + t as u64 * 13) % max_target;
                        let fired = Arc::clone(&fired);
                        registered.fetch_add(1, Ordering::SeqCst);
                        session.wait_for_transferred(direction, target, move |_: CompletionOutcome| {
                            fired.fetch_add(1, Ordering::SeqCst);
                        });
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let current = session.progress().estimate(direction);
                        let transferable = (current.transferable + 5).min(max_target);
                        let transferred = (current.transferred + 3).min(transferable);
                        match session.handle_progress_update(direction, transferred, transferable) {
                            Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                            Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                }
            })
        })
        .collect();

    if config.inject_faults {
        let session = Arc::clone(&session);
        let scheduler = Arc::clone(&harness.scheduler);
        let rounds = config.operations / 50 + 1;
        handles.push(thread::spawn(move || {
            for round in 0..rounds {
                match round % 3 {
                    0 => session.handle_error(SessionErrorInfo::transient(Status::new(
                        ErrorCode::ConnectionClosed,
                        "stress disconnect",
                    ))),
                    1 => {
                        session.suspend();
                        session.resume();
                    }
                    _ => {
                        scheduler.run_pending();
                    }
                }
                thread::yield_now();
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    session.force_close();

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        registered.load(Ordering::SeqCst),
        fired.load(Ordering::SeqCst),
        start.elapsed(),
    )
}
