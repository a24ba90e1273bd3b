//! Deferred execution of reconnect attempts.

use parking_lot::Mutex;
use std::time::Duration;
use tracing::trace;

/// Work scheduled for later.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after a delay.
///
/// Sessions use this to back off between reconnect attempts. A task must
/// never run on the thread that scheduled it before `schedule` returns.
pub trait ReconnectScheduler: Send + Sync {
    /// Runs `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

/// Schedules tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioReconnectScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioReconnectScheduler {
    /// Uses the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context, if any.
    pub fn from_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl ReconnectScheduler for TokioReconnectScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        trace!(?delay, "scheduling task on tokio runtime");
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

/// Schedules each task on its own sleeping thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadReconnectScheduler;

impl ReconnectScheduler for ThreadReconnectScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        trace!(?delay, "scheduling task on background thread");
        std::thread::spawn(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            task();
        });
    }
}

/// Holds tasks until the caller runs them explicitly.
#[derive(Default)]
pub struct ManualReconnectScheduler {
    pending: Mutex<Vec<(Duration, ScheduledTask)>>,
}

impl ManualReconnectScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Delays of the waiting tasks, in scheduling order.
    pub fn delays(&self) -> Vec<Duration> {
        self.pending.lock().iter().map(|(delay, _)| *delay).collect()
    }

    /// Runs every task scheduled so far, in order. Tasks scheduled while
    /// running stay pending. Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let tasks = std::mem::take(&mut *self.pending.lock());
        let count = tasks.len();
        for (_, task) in tasks {
            task();
        }
        count
    }

    /// Drops every waiting task without running it.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl ReconnectScheduler for ManualReconnectScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        self.pending.lock().push((delay, task));
    }
}

impl std::fmt::Debug for ManualReconnectScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualReconnectScheduler")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn manual_runs_in_order() {
        let scheduler = ManualReconnectScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            scheduler.schedule(Duration::from_millis(i), Box::new(move || log.lock().push(i)));
        }

        assert_eq!(scheduler.pending_count(), 3);
        assert_eq!(scheduler.delays()[2], Duration::from_millis(2));
        assert_eq!(scheduler.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn thread_scheduler_runs_task() {
        let (tx, rx) = std::sync::mpsc::channel();
        ThreadReconnectScheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn tokio_scheduler_runs_task() {
        let scheduler = TokioReconnectScheduler::from_current().expect("inside runtime");
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let c = Arc::clone(&counter);
        scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }),
        );
        rx.await.expect("task ran");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_runtime_outside_tokio() {
        assert!(TokioReconnectScheduler::from_current().is_none());
    }
}
