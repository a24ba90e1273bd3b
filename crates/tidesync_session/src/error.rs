//! Error types for the session layer.

use crate::session::SessionState;
use thiserror::Error;
use tidesync_protocol::{ProgressDirection, ProgressEstimate};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors returned by session and coordinator operations.
///
/// Protocol and network failures never show up here: those are absorbed by
/// [`crate::SyncSession::handle_error`] and reported through the session's
/// error handler. This type covers rejected calls and internal faults.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A progress update moved backwards and was not applied.
    #[error("{direction} progress regressed from {previous:?} to {proposed:?}")]
    ProgressRegression {
        /// Direction of the rejected update.
        direction: ProgressDirection,
        /// Last accepted estimate.
        previous: ProgressEstimate,
        /// Rejected estimate.
        proposed: ProgressEstimate,
    },

    /// A progress update arrived while the session was not transferring.
    #[error("progress update ignored while session is {state}")]
    NotAcceptingProgress {
        /// State of the session when the update arrived.
        state: SessionState,
    },

    /// An internal invariant was violated.
    ///
    /// This indicates a bug in a collaborator or in this crate, never a
    /// network or server condition.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    /// The configuration was rejected.
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    /// The user backing a session no longer exists.
    #[error("user unavailable: {0}")]
    UserUnavailable(String),

    /// The coordinator was shut down.
    #[error("session coordinator has been shut down")]
    CoordinatorShutDown,
}

impl SessionError {
    /// Creates an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Returns true if this error reports a programming error rather than a
    /// rejected call.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, SessionError::InvariantViolation { .. })
    }
}
