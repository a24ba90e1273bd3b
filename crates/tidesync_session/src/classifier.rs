//! Error classification.
//!
//! Maps a [`SessionErrorInfo`] to the recovery [`Decision`] the session
//! applies. Classification is a pure function of the error.

use std::fmt;
use tidesync_protocol::{ProtocolErrorAction, SessionErrorInfo};

/// Recovery decision for a session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Keep the session and reconnect with backoff.
    Retry,
    /// Stop until the application resumes the session.
    Suspend,
    /// Tear the session down and fail every pending waiter.
    Terminate,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Retry => f.write_str("retry"),
            Decision::Suspend => f.write_str("suspend"),
            Decision::Terminate => f.write_str("terminate"),
        }
    }
}

/// Classifies a session error.
///
/// Fatal errors always terminate. Non-fatal errors follow the action the
/// server requested; actions this client cannot act on terminate.
pub fn classify(info: &SessionErrorInfo) -> Decision {
    if info.is_fatal {
        return Decision::Terminate;
    }

    match info.server_requests_action {
        ProtocolErrorAction::NoAction
        | ProtocolErrorAction::Warning
        | ProtocolErrorAction::Transient
        | ProtocolErrorAction::RefreshUser
        | ProtocolErrorAction::RefreshLocation => Decision::Retry,
        ProtocolErrorAction::ProtocolViolation | ProtocolErrorAction::ApplicationBug => {
            Decision::Suspend
        }
        ProtocolErrorAction::LogOutUser
        | ProtocolErrorAction::ClientReset
        | ProtocolErrorAction::ClientResetNoRecovery
        | ProtocolErrorAction::DeleteLocalFile
        | ProtocolErrorAction::BackupThenDeleteLocalFile
        | ProtocolErrorAction::Unrecognized(_) => Decision::Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tidesync_protocol::{ErrorCode, Status};

    fn status() -> Status {
        Status::new(ErrorCode::SyncProtocolInvariantFailed, "Not a real error message")
    }

    #[test]
    fn fatal_always_terminates() {
        let info = SessionErrorInfo::fatal(status())
            .with_action(ProtocolErrorAction::ProtocolViolation);
        assert_eq!(classify(&info), Decision::Terminate);

        let info = SessionErrorInfo::fatal(status()).with_action(ProtocolErrorAction::Transient);
        assert_eq!(classify(&info), Decision::Terminate);
    }

    #[test]
    fn protocol_violation_suspends() {
        let info = SessionErrorInfo::protocol_violation(status());
        assert_eq!(classify(&info), Decision::Suspend);

        let info = SessionErrorInfo::new(status(), false)
            .with_action(ProtocolErrorAction::ApplicationBug);
        assert_eq!(classify(&info), Decision::Suspend);
    }

    #[test]
    fn transient_retries() {
        let info = SessionErrorInfo::transient(Status::new(ErrorCode::ConnectionClosed, "reset"));
        assert_eq!(classify(&info), Decision::Retry);
    }

    #[test]
    fn unrecognized_terminates() {
        let info = SessionErrorInfo::new(status(), false)
            .with_action(ProtocolErrorAction::from_code(4242));
        assert_eq!(classify(&info), Decision::Terminate);
    }

    proptest! {
        #[test]
        fn classification_is_total(code in any::<u32>(), fatal in any::<bool>()) {
            let info = SessionErrorInfo::new(status(), fatal)
                .with_action(ProtocolErrorAction::from_code(code));
            let decision = classify(&info);
            if fatal {
                prop_assert_eq!(decision, Decision::Terminate);
            }
            prop_assert_eq!(decision, classify(&info.clone()));
        }
    }
}
