//! Property-based test generators using proptest.
//!
//! Provides strategies for random sequences of session events, and a way to
//! replay them against a [`TestHarness`] session.

use crate::fixtures::{CompletionProbe, TestHarness};
use proptest::prelude::*;
use std::sync::Arc;
use tidesync_protocol::{ErrorCode, ProgressDirection, ProtocolErrorAction, SessionErrorInfo, Status};
use tidesync_session::{AccessToken, ConnectionState, SyncSession};

/// One externally driven event in a session's life.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Application calls `bind`.
    Bind,
    /// Pending token requests are granted.
    GrantTokens,
    /// Application registers a waiter for `target` bytes.
    WaitFor {
        /// Direction of the waiter.
        direction: ProgressDirection,
        /// Target in bytes.
        target: u64,
    },
    /// Application registers a waiter for the current transferable amount.
    WaitForCompletion(ProgressDirection),
    /// Transport reports progress growing by the given amounts.
    Progress {
        /// Direction of the update.
        direction: ProgressDirection,
        /// Growth of transferred bytes.
        transferred_delta: u64,
        /// Growth of transferable bytes.
        transferable_delta: u64,
    },
    /// Transport reports an error with the given action.
    Error {
        /// Whether the error is fatal.
        is_fatal: bool,
        /// Raw action code.
        action: u32,
    },
    /// Connection comes up.
    Connected,
    /// Connection drops.
    Disconnected,
    /// Scheduled reconnects run.
    RunScheduled,
    /// User logs out.
    LogOut,
    /// User logs back in.
    LogIn,
    /// Application suspends the session.
    Suspend,
    /// Application resumes the session.
    Resume,
    /// Application closes the session.
    Close,
}

/// Strategy for a progress direction.
pub fn direction_strategy() -> impl Strategy<Value = ProgressDirection> {
    prop_oneof![Just(ProgressDirection::Upload), Just(ProgressDirection::Download)]
}

/// Strategy for a single session event.
pub fn session_event_strategy() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        2 => Just(SessionEvent::Bind),
        2 => Just(SessionEvent::GrantTokens),
        4 => (direction_strategy(), 0u64..400)
            .prop_map(|(direction, target)| SessionEvent::WaitFor { direction, target }),
        1 => direction_strategy().prop_map(SessionEvent::WaitForCompletion),
        5 => (direction_strategy(), 0u64..80, 0u64..80).prop_map(
            |(direction, transferred_delta, transferable_delta)| SessionEvent::Progress {
                direction,
                transferred_delta,
                transferable_delta,
            }
        ),
        2 => (prop::bool::weighted(0.2), 0u32..13)
            .prop_map(|(is_fatal, action)| SessionEvent::Error { is_fatal, action }),
        1 => Just(SessionEvent::Connected),
        1 => Just(SessionEvent::Disconnected),
        1 => Just(SessionEvent::RunScheduled),
        1 => Just(SessionEvent::LogOut),
        1 => Just(SessionEvent::LogIn),
        1 => Just(SessionEvent::Suspend),
        1 => Just(SessionEvent::Resume),
        1 => Just(SessionEvent::Close),
    ]
}

/// Strategy for a sequence of session events.
pub fn event_sequence_strategy(
    min_events: usize,
    max_events: usize,
) -> impl Strategy<Value = Vec<SessionEvent>> {
    prop::collection::vec(session_event_strategy(), min_events..max_events)
}

/// Replays `event` against `session`. Waiters record into `probe`.
///
/// Returns the number of waiters registered. Progress events are applied
/// on top of the session's current progress so they never regress.
pub fn apply_event(
    harness: &TestHarness,
    session: &Arc<SyncSession>,
    probe: &CompletionProbe,
    event: &SessionEvent,
) -> usize {
    match event {
        SessionEvent::Bind => session.bind(),
        SessionEvent::GrantTokens => {
            harness.tokens.grant_all();
        }
        SessionEvent::WaitFor { direction, target } => {
            session.wait_for_transferred(*direction, *target, probe.callback("waiter"));
            return 1;
        }
        SessionEvent::WaitForCompletion(ProgressDirection::Upload) => {
            session.wait_for_upload_completion(probe.callback("upload"));
            return 1;
        }
        SessionEvent::WaitForCompletion(ProgressDirection::Download) => {
            session.wait_for_download_completion(probe.callback("download"));
            return 1;
        }
        SessionEvent::Progress {
            direction,
            transferred_delta,
            transferable_delta,
        } => {
            let current = session.progress().estimate(*direction);
            let transferable = current.transferable + transferable_delta;
            let transferred = (current.transferred + transferred_delta).min(transferable);
            let _ = session.handle_progress_update(*direction, transferred, transferable);
        }
        SessionEvent::Error { is_fatal, action } => {
            let info = SessionErrorInfo::new(
                Status::new(ErrorCode::SyncProtocolInvariantFailed, "generated error"),
                *is_fatal,
            )
            .with_action(ProtocolErrorAction::from_code(*action));
            session.handle_error(info);
        }
        SessionEvent::Connected => session
            .connection()
            .handle_connection_state_change(ConnectionState::Connected, None),
        SessionEvent::Disconnected => session
            .connection()
            .handle_connection_state_change(ConnectionState::Disconnected, None),
        SessionEvent::RunScheduled => {
            harness.scheduler.run_pending();
        }
        SessionEvent::LogOut => harness.user.log_out(),
        SessionEvent::LogIn => harness.user.log_in(AccessToken::new("token-next")),
        SessionEvent::Suspend => session.suspend(),
        SessionEvent::Resume => session.resume(),
        SessionEvent::Close => session.close(),
    }
    0
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn progress_events_never_regress(events in event_sequence_strategy(1, 40)) {
            let harness = TestHarness::new();
            let session = harness.active_session("/gen");
            let probe = CompletionProbe::new();
            let mut last = session.progress();
            for event in &events {
                apply_event(&harness, &session, &probe, event);
                let now = session.progress();
                prop_assert!(now.uploaded >= last.uploaded);
                prop_assert!(now.downloaded >= last.downloaded);
                prop_assert!(now.uploaded <= now.uploadable);
                prop_assert!(now.downloaded <= now.downloadable);
                last = now;
            }
        }

        #[test]
        fn error_actions_cover_known_codes(action in 0u32..13) {
            let parsed = ProtocolErrorAction::from_code(action);
            prop_assert_eq!(parsed.code(), action);
        }
    }
}
