//! Server-reported session errors.

use crate::status::{ErrorCode, Status};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The recovery action a server asks the client to take along with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolErrorAction {
    /// No particular action requested.
    NoAction,
    /// Client and server disagree on protocol semantics.
    ProtocolViolation,
    /// The client application misbehaved.
    ApplicationBug,
    /// Informational; the session can continue.
    Warning,
    /// A temporary condition; reconnect later.
    Transient,
    /// The local file must be deleted.
    DeleteLocalFile,
    /// The local file must be reset from the server.
    ClientReset,
    /// The local file must be reset, discarding unsynced changes.
    ClientResetNoRecovery,
    /// The local file must be backed up and then deleted.
    BackupThenDeleteLocalFile,
    /// The user's access token must be refreshed.
    RefreshUser,
    /// The server location must be looked up again.
    RefreshLocation,
    /// The user must be logged out.
    LogOutUser,
    /// An action code this client does not understand.
    Unrecognized(u32),
}

impl ProtocolErrorAction {
    /// Maps a raw server action code.
    ///
    /// Unknown codes become [`ProtocolErrorAction::Unrecognized`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::NoAction,
            1 => Self::ProtocolViolation,
            2 => Self::ApplicationBug,
            3 => Self::Warning,
            4 => Self::Transient,
            5 => Self::DeleteLocalFile,
            6 => Self::ClientReset,
            7 => Self::ClientResetNoRecovery,
            8 => Self::BackupThenDeleteLocalFile,
            9 => Self::RefreshUser,
            10 => Self::RefreshLocation,
            11 => Self::LogOutUser,
            other => Self::Unrecognized(other),
        }
    }

    /// Returns the raw server action code.
    pub fn code(self) -> u32 {
        match self {
            Self::NoAction => 0,
            Self::ProtocolViolation => 1,
            Self::ApplicationBug => 2,
            Self::Warning => 3,
            Self::Transient => 4,
            Self::DeleteLocalFile => 5,
            Self::ClientReset => 6,
            Self::ClientResetNoRecovery => 7,
            Self::BackupThenDeleteLocalFile => 8,
            Self::RefreshUser => 9,
            Self::RefreshLocation => 10,
            Self::LogOutUser => 11,
            Self::Unrecognized(code) => code,
        }
    }
}

impl Default for ProtocolErrorAction {
    fn default() -> Self {
        Self::NoAction
    }
}

/// An error event delivered to a session.
///
/// Constructed once per event by the transport and consumed by the
/// session's error classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionErrorInfo {
    /// The error itself.
    pub status: Status,
    /// Whether the session cannot continue without outside intervention.
    pub is_fatal: bool,
    /// The recovery action requested by the server.
    pub server_requests_action: ProtocolErrorAction,
}

impl SessionErrorInfo {
    /// Creates error info with no requested action.
    pub fn new(status: Status, is_fatal: bool) -> Self {
        Self {
            status,
            is_fatal,
            server_requests_action: ProtocolErrorAction::NoAction,
        }
    }

    /// Creates a non-fatal error that should be retried.
    pub fn transient(status: Status) -> Self {
        Self::new(status, false).with_action(ProtocolErrorAction::Transient)
    }

    /// Creates a non-fatal protocol violation.
    pub fn protocol_violation(status: Status) -> Self {
        Self::new(status, false).with_action(ProtocolErrorAction::ProtocolViolation)
    }

    /// Creates a fatal error.
    pub fn fatal(status: Status) -> Self {
        Self::new(status, true)
    }

    /// Creates error info from a connection-level failure.
    ///
    /// Transient connection codes are retried; anything else is fatal.
    pub fn from_connection_status(status: Status) -> Self {
        if status.code().is_transient() {
            Self::transient(status)
        } else {
            Self::fatal(status)
        }
    }

    /// Sets the requested action.
    #[must_use]
    pub fn with_action(mut self, action: ProtocolErrorAction) -> Self {
        self.server_requests_action = action;
        self
    }

    /// Returns the error code of the status.
    pub fn code(&self) -> ErrorCode {
        self.status.code()
    }
}

impl fmt::Display for SessionErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (fatal: {}, action: {:?})",
            self.status, self.is_fatal, self.server_requests_action
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn constructors() {
        let status = Status::new(ErrorCode::ConnectionClosed, "reset");
        let info = SessionErrorInfo::transient(status.clone());
        assert!(!info.is_fatal);
        assert_eq!(info.server_requests_action, ProtocolErrorAction::Transient);
        assert_eq!(info.code(), ErrorCode::ConnectionClosed);

        let info = SessionErrorInfo::fatal(status);
        assert!(info.is_fatal);
        assert_eq!(info.server_requests_action, ProtocolErrorAction::NoAction);
    }

    #[test]
    fn connection_status_mapping() {
        let info = SessionErrorInfo::from_connection_status(Status::new(
            ErrorCode::ReadError,
            "broken pipe",
        ));
        assert!(!info.is_fatal);

        let info = SessionErrorInfo::from_connection_status(Status::new(
            ErrorCode::TlsHandshakeFailed,
            "bad certificate",
        ));
        assert!(!info.is_fatal);

        let info = SessionErrorInfo::from_connection_status(Status::new(
            ErrorCode::AuthError,
            "revoked",
        ));
        assert!(info.is_fatal);
    }

    #[test]
    fn unknown_action_codes() {
        assert_eq!(
            ProtocolErrorAction::from_code(999),
            ProtocolErrorAction::Unrecognized(999)
        );
        assert_eq!(ProtocolErrorAction::from_code(4), ProtocolErrorAction::Transient);
    }

    proptest! {
        #[test]
        fn action_code_is_stable(code in any::<u32>()) {
            prop_assert_eq!(ProtocolErrorAction::from_code(code).code(), code);
        }
    }
}
