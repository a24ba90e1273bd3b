//! Progress validation and progress notifiers.

use crate::error::{SessionError, SessionResult};
use std::sync::Arc;
use tidesync_protocol::{ProgressDirection, ProgressEstimate};

/// Callback receiving progress estimates.
pub type ProgressCallback = Arc<dyn Fn(ProgressEstimate) + Send + Sync + 'static>;

/// Checks a progress update against the last accepted estimate.
///
/// Transferred bytes may never exceed transferable bytes, and neither
/// counter may move backwards.
pub fn validate_update(
    direction: ProgressDirection,
    previous: ProgressEstimate,
    proposed: ProgressEstimate,
) -> SessionResult<()> {
    if proposed.transferred > proposed.transferable {
        return Err(SessionError::invariant(format!(
            "{direction} transferred ({}) exceeds transferable ({})",
            proposed.transferred, proposed.transferable
        )));
    }
    if proposed.transferred < previous.transferred || proposed.transferable < previous.transferable
    {
        return Err(SessionError::ProgressRegression {
            direction,
            previous,
            proposed,
        });
    }
    Ok(())
}

struct Notifier {
    token: u64,
    direction: ProgressDirection,
    streaming: bool,
    captured_target: Option<u64>,
    callback: ProgressCallback,
}

impl Notifier {
    /// Estimate this notifier reports for `estimate`, and whether it is
    /// finished afterwards.
    fn report(&mut self, estimate: ProgressEstimate) -> (ProgressEstimate, bool) {
        if self.streaming {
            return (estimate, false);
        }
        let target = *self.captured_target.get_or_insert(estimate.transferable);
        let reported = ProgressEstimate::new(estimate.transferred.min(target), target);
        (reported, reported.is_complete())
    }
}

/// Progress notifiers registered on one session.
///
/// A streaming notifier reports every update. A non-streaming notifier
/// captures the transferable byte count of the first estimate it sees and
/// reports progress towards that fixed target, then unregisters itself.
#[derive(Default)]
pub struct ProgressNotifiers {
    next_token: u64,
    notifiers: Vec<Notifier>,
}

impl ProgressNotifiers {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a notifier.
    ///
    /// When `current` is known the notifier's first report is returned
    /// alongside the token so the caller can deliver it outside any lock.
    pub fn register(
        &mut self,
        callback: ProgressCallback,
        direction: ProgressDirection,
        streaming: bool,
        current: Option<ProgressEstimate>,
    ) -> (u64, Option<(ProgressCallback, ProgressEstimate)>) {
        self.next_token += 1;
        let token = self.next_token;
        let mut notifier = Notifier {
            token,
            direction,
            streaming,
            captured_target: None,
            callback,
        };

        let mut immediate = None;
        let mut keep = true;
        if let Some(estimate) = current {
            let (reported, finished) = notifier.report(estimate);
            immediate = Some((Arc::clone(&notifier.callback), reported));
            keep = !finished;
        }
        if keep {
            self.notifiers.push(notifier);
        }
        (token, immediate)
    }

    /// Removes a notifier. Unknown tokens are ignored.
    pub fn unregister(&mut self, token: u64) {
        self.notifiers.retain(|notifier| notifier.token != token);
    }

    /// Computes the reports for an update and drops finished non-streaming
    /// notifiers. The caller invokes the returned callbacks.
    pub fn on_update(
        &mut self,
        direction: ProgressDirection,
        estimate: ProgressEstimate,
    ) -> Vec<(ProgressCallback, ProgressEstimate)> {
        let mut reports = Vec::new();
        self.notifiers.retain_mut(|notifier| {
            if notifier.direction != direction {
                return true;
            }
            let (reported, finished) = notifier.report(estimate);
            reports.push((Arc::clone(&notifier.callback), reported));
            !finished
        });
        reports
    }

    /// Number of registered notifiers.
    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    /// Returns true if no notifier is registered.
    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl std::fmt::Debug for ProgressNotifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressNotifiers")
            .field("count", &self.notifiers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEstimate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |estimate| sink.lock().push(estimate));
        (callback, seen)
    }

    #[test]
    fn validate_rejects_regression() {
        let previous = ProgressEstimate::new(50, 100);
        assert!(validate_update(ProgressDirection::Download, previous, ProgressEstimate::new(60, 100)).is_ok());

        let err = validate_update(ProgressDirection::Download, previous, ProgressEstimate::new(40, 100))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProgressRegression { .. }));

        let err = validate_update(ProgressDirection::Upload, previous, ProgressEstimate::new(60, 90))
            .unwrap_err();
        assert!(matches!(err, SessionError::ProgressRegression { .. }));
    }

    #[test]
    fn validate_rejects_overflowing_transfer() {
        let err = validate_update(
            ProgressDirection::Upload,
            ProgressEstimate::default(),
            ProgressEstimate::new(11, 10),
        )
        .unwrap_err();
        assert!(err.is_programming_error());
    }

    #[test]
    fn streaming_reports_everything() {
        let mut notifiers = ProgressNotifiers::new();
        let (callback, seen) = recorder();
        let (_, immediate) = notifiers.register(callback, ProgressDirection::Download, true, None);
        assert!(immediate.is_none());

        for (cb, est) in notifiers.on_update(ProgressDirection::Download, ProgressEstimate::new(10, 100)) {
            cb(est);
        }
        for (cb, est) in notifiers.on_update(ProgressDirection::Download, ProgressEstimate::new(100, 200)) {
            cb(est);
        }
        assert!(notifiers.on_update(ProgressDirection::Upload, ProgressEstimate::new(1, 1)).is_empty());

        assert_eq!(
            *seen.lock(),
            vec![ProgressEstimate::new(10, 100), ProgressEstimate::new(100, 200)]
        );
        assert_eq!(notifiers.len(), 1);
    }

    #[test]
    fn non_streaming_captures_target_and_finishes() {
        let mut notifiers = ProgressNotifiers::new();
        let (callback, seen) = recorder();
        let (_, immediate) = notifiers.register(
            callback,
            ProgressDirection::Upload,
            false,
            Some(ProgressEstimate::new(10, 100)),
        );
        let (cb, est) = immediate.expect("current estimate known");
        cb(est);

        for (cb, est) in notifiers.on_update(ProgressDirection::Upload, ProgressEstimate::new(150, 300)) {
            cb(est);
        }

        assert_eq!(
            *seen.lock(),
            vec![ProgressEstimate::new(10, 100), ProgressEstimate::new(100, 100)]
        );
        assert!(notifiers.is_empty());
    }

    #[test]
    fn unregister_removes() {
        let mut notifiers = ProgressNotifiers::new();
        let (callback, _) = recorder();
        let (token, _) = notifiers.register(callback, ProgressDirection::Upload, true, None);
        notifiers.unregister(token);
        notifiers.unregister(token + 10);
        assert!(notifiers.is_empty());
    }
}
