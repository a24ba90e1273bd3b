//! Opening a session once its initial download has finished.

use crate::registry::CompletionOutcome;
use crate::session::SyncSession;
use parking_lot::Mutex;
use std::sync::Arc;
use tidesync_protocol::{ProgressDirection, ProgressEstimate, Status};
use tracing::debug;

/// Receives the opened session, or the reason opening failed.
pub type AsyncOpenCallback = Box<dyn FnOnce(Result<Arc<SyncSession>, Status>) + Send + 'static>;

#[derive(Default)]
struct AsyncOpenInner {
    session: Option<Arc<SyncSession>>,
    notifier_tokens: Vec<u64>,
}

/// Binds a session and reports it once everything downloadable at start
/// time has been downloaded.
///
/// The task completes at most once. After [`AsyncOpenTask::cancel`] the
/// callback is never invoked.
pub struct AsyncOpenTask {
    inner: Mutex<AsyncOpenInner>,
}

impl AsyncOpenTask {
    /// Creates a task for `session`.
    pub fn new(session: Arc<SyncSession>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(AsyncOpenInner {
                session: Some(session),
                notifier_tokens: Vec::new(),
            }),
        })
    }

    /// Starts the task. `callback` runs once the download completes or the
    /// session fails.
    pub fn start(self: &Arc<Self>, callback: AsyncOpenCallback) {
        let Some(session) = self.inner.lock().session.clone() else {
            debug!("async open started after cancellation");
            return;
        };

        let task = Arc::clone(self);
        session.wait_for_download_completion(move |outcome| task.complete(outcome, callback));
        session.bind();
    }

    /// Cancels the task and force-closes its session.
    pub fn cancel(&self) {
        let Some((session, tokens)) = self.take() else {
            return;
        };
        debug!(session_id = %session.session_id(), "async open cancelled");
        for token in tokens {
            session.unregister_progress_notifier(token);
        }
        session.force_close();
    }

    /// Registers a streaming download progress notifier on the session.
    ///
    /// Returns `None` once the task has completed or been cancelled.
    pub fn register_download_progress_notifier(
        &self,
        callback: impl Fn(ProgressEstimate) + Send + Sync + 'static,
    ) -> Option<u64> {
        let session = self.inner.lock().session.clone()?;
        let token = session.register_progress_notifier(callback, ProgressDirection::Download, true);

        let mut inner = self.inner.lock();
        if inner.session.is_some() {
            inner.notifier_tokens.push(token);
            Some(token)
        } else {
            drop(inner);
            session.unregister_progress_notifier(token);
            None
        }
    }

    /// Removes a notifier registered through this task.
    pub fn unregister_download_progress_notifier(&self, token: u64) {
        let session = {
            let mut inner = self.inner.lock();
            inner.notifier_tokens.retain(|t| *t != token);
            inner.session.clone()
        };
        if let Some(session) = session {
            session.unregister_progress_notifier(token);
        }
    }

    /// Returns true once the task has completed or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.inner.lock().session.is_none()
    }

    fn take(&self) -> Option<(Arc<SyncSession>, Vec<u64>)> {
        let mut inner = self.inner.lock();
        let session = inner.session.take()?;
        Some((session, std::mem::take(&mut inner.notifier_tokens)))
    }

    fn complete(&self, outcome: CompletionOutcome, callback: AsyncOpenCallback) {
        let Some((session, tokens)) = self.take() else {
            return;
        };
        for token in tokens {
            session.unregister_progress_notifier(token);
        }
        match outcome {
            CompletionOutcome::Success => callback(Ok(session)),
            CompletionOutcome::Aborted(status) | CompletionOutcome::Failed(status) => {
                debug!(session_id = %session.session_id(), error = %status, "async open failed");
                callback(Err(status));
            }
        }
    }
}

impl std::fmt::Debug for AsyncOpenTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOpenTask")
            .field("finished", &self.is_finished())
            .finish()
    }
}
