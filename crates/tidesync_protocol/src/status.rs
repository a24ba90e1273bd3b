//! Status values and the error code taxonomy.
//!
//! A [`Status`] is either OK or carries an [`ErrorCode`] plus a reason.
//! Codes are grouped into [`ErrorCategory`] values so callers can dispatch
//! on the broad class of a failure with a single exhaustive `match`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Broad class of an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Incorrect use of the public API.
    LogicError,
    /// A logic error caused by a bad argument.
    InvalidArgument,
    /// Failure that depends on runtime conditions.
    RuntimeError,
    /// Failure accessing a file; usually carries a path.
    FileAccess,
    /// Failure reported by the operating system.
    SystemError,
    /// Failure reported by the sync server or the sync protocol.
    Sync,
    /// Failure of the underlying network connection.
    Connection,
}

/// Error code carried by a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No error.
    Ok,
    /// The operation was cancelled before it could complete.
    OperationAborted,
    /// An error that could not be classified.
    UnknownError,
    /// Generic runtime failure.
    RuntimeError,
    /// Generic API misuse.
    LogicError,
    /// The operation is not allowed in the current state.
    IllegalOperation,
    /// A transaction was in the wrong state for the operation.
    WrongTransactionState,
    /// A caller supplied an invalid argument.
    InvalidArgument,
    /// The encryption key has the wrong length.
    InvalidEncryptionKey,
    /// A file operation failed.
    FileOperationFailed,
    /// A file was not found.
    FileNotFound,
    /// Access to a file was denied.
    PermissionDenied,
    /// A file uses a format version that cannot be upgraded.
    UnsupportedFileFormatVersion,
    /// Writing failed because the disk is full.
    OutOfDiskSpace,
    /// Memory mapping failed.
    AddressSpaceExhausted,
    /// A reference grew beyond the addressable size.
    MaximumFileSizeExceeded,
    /// An operating system error; see [`Status::os_error`].
    SystemError,
    /// The connection was closed by the peer.
    ConnectionClosed,
    /// Reading from the connection failed.
    ReadError,
    /// Writing to the connection failed.
    WriteError,
    /// Resolving the server address failed.
    ResolveFailed,
    /// Connecting to the server timed out.
    ConnectTimeout,
    /// The TLS handshake failed.
    TlsHandshakeFailed,
    /// The server detected a violation of a protocol invariant.
    SyncProtocolInvariantFailed,
    /// Client and server could not agree on a protocol version.
    SyncProtocolNegotiationFailed,
    /// The server requires the client to reset its local state.
    SyncClientResetRequired,
    /// The user is not permitted to sync this file.
    SyncPermissionDenied,
    /// The file belongs to a different user.
    SyncUserMismatch,
    /// The server schema is incompatible with the local file.
    SyncSchemaMigrationError,
    /// Another sync agent already joined this session.
    MultipleSyncAgents,
    /// The server path was rejected.
    BadSyncPartitionValue,
    /// The server does not recognize the session.
    InvalidSession,
    /// Authentication was rejected.
    AuthError,
    /// The user does not exist.
    ClientUserNotFound,
    /// The user is not logged in.
    ClientUserNotLoggedIn,
}

impl ErrorCode {
    /// Returns the category of this code, or `None` for [`ErrorCode::Ok`].
    pub fn category(self) -> Option<ErrorCategory> {
        use ErrorCode::*;
        let category = match self {
            Ok => return None,
            OperationAborted | UnknownError | RuntimeError | MultipleSyncAgents => {
                ErrorCategory::RuntimeError
            }
            LogicError | IllegalOperation | WrongTransactionState => ErrorCategory::LogicError,
            InvalidArgument | InvalidEncryptionKey => ErrorCategory::InvalidArgument,
            FileOperationFailed
            | FileNotFound
            | PermissionDenied
            | UnsupportedFileFormatVersion
            | OutOfDiskSpace
            | AddressSpaceExhausted
            | MaximumFileSizeExceeded => ErrorCategory::FileAccess,
            SystemError => ErrorCategory::SystemError,
            ConnectionClosed | ReadError | WriteError | ResolveFailed | ConnectTimeout
            | TlsHandshakeFailed => ErrorCategory::Connection,
            SyncProtocolInvariantFailed
            | SyncProtocolNegotiationFailed
            | SyncClientResetRequired
            | SyncPermissionDenied
            | SyncUserMismatch
            | SyncSchemaMigrationError
            | BadSyncPartitionValue
            | InvalidSession
            | AuthError
            | ClientUserNotFound
            | ClientUserNotLoggedIn => ErrorCategory::Sync,
        };
        Some(category)
    }

    /// Returns true if the code describes a condition that may clear up on
    /// its own, such as a dropped connection.
    pub fn is_transient(self) -> bool {
        matches!(self.category(), Some(ErrorCategory::Connection))
    }

    /// Returns the stable name of this code.
    pub fn as_str(self) -> &'static str {
        use ErrorCode::*;
        match self {
            Ok => "OK",
            OperationAborted => "OperationAborted",
            UnknownError => "UnknownError",
            RuntimeError => "RuntimeError",
            LogicError => "LogicError",
            IllegalOperation => "IllegalOperation",
            WrongTransactionState => "WrongTransactionState",
            InvalidArgument => "InvalidArgument",
            InvalidEncryptionKey => "InvalidEncryptionKey",
            FileOperationFailed => "FileOperationFailed",
            FileNotFound => "FileNotFound",
            PermissionDenied => "PermissionDenied",
            UnsupportedFileFormatVersion => "UnsupportedFileFormatVersion",
            OutOfDiskSpace => "OutOfDiskSpace",
            AddressSpaceExhausted => "AddressSpaceExhausted",
            MaximumFileSizeExceeded => "MaximumFileSizeExceeded",
            SystemError => "SystemError",
            ConnectionClosed => "ConnectionClosed",
            ReadError => "ReadError",
            WriteError => "WriteError",
            ResolveFailed => "ResolveFailed",
            ConnectTimeout => "ConnectTimeout",
            TlsHandshakeFailed => "TlsHandshakeFailed",
            SyncProtocolInvariantFailed => "SyncProtocolInvariantFailed",
            SyncProtocolNegotiationFailed => "SyncProtocolNegotiationFailed",
            SyncClientResetRequired => "SyncClientResetRequired",
            SyncPermissionDenied => "SyncPermissionDenied",
            SyncUserMismatch => "SyncUserMismatch",
            SyncSchemaMigrationError => "SyncSchemaMigrationError",
            MultipleSyncAgents => "MultipleSyncAgents",
            BadSyncPartitionValue => "BadSyncPartitionValue",
            InvalidSession => "InvalidSession",
            AuthError => "AuthError",
            ClientUserNotFound => "ClientUserNotFound",
            ClientUserNotLoggedIn => "ClientUserNotLoggedIn",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of an operation: OK, or an error code with a reason.
///
/// File access failures may carry the affected path, and system failures
/// the raw OS error number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: ErrorCode,
    reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    os_error: Option<i32>,
}

impl Status {
    /// Creates a status with the given code and reason.
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            path: None,
            os_error: None,
        }
    }

    /// Returns the OK status.
    pub fn ok() -> Self {
        Self::new(ErrorCode::Ok, "")
    }

    /// Creates an [`ErrorCode::OperationAborted`] status.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::OperationAborted, reason)
    }

    /// Creates a file access status carrying the affected path.
    pub fn file_access(code: ErrorCode, reason: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::new(code, reason).with_path(path)
    }

    /// Converts an arbitrary error into a status.
    ///
    /// The error message becomes the reason and the code is
    /// [`ErrorCode::UnknownError`].
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(status) = error.downcast_ref::<Status>() {
            return status.clone();
        }
        Self::new(ErrorCode::UnknownError, error.to_string())
    }

    /// Attaches a file system path.
    #[must_use]
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Attaches a raw OS error number.
    #[must_use]
    pub fn with_os_error(mut self, errno: i32) -> Self {
        self.os_error = Some(errno);
        self
    }

    /// Returns true if this is the OK status.
    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }

    /// Returns true if this status reports a cancelled operation.
    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::OperationAborted
    }

    /// Returns the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the category of the error code.
    pub fn category(&self) -> Option<ErrorCategory> {
        self.code.category()
    }

    /// Returns the human-readable reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the associated file system path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the raw OS error number, if any.
    pub fn os_error(&self) -> Option<i32> {
        self.os_error
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("OK");
        }
        write!(f, "{}: {}", self.code, self.reason)?;
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(errno) = self.os_error {
            write!(f, " (os error {errno})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            _ => ErrorCode::SystemError,
        };
        let status = Status::new(code, err.to_string());
        match err.raw_os_error() {
            Some(errno) => status.with_os_error(errno),
            None => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert!(!status.is_aborted());
        assert_eq!(status.category(), None);
        assert_eq!(status.to_string(), "OK");
        assert_eq!(Status::default(), status);
    }

    #[test]
    fn error_display() {
        let status = Status::new(ErrorCode::SyncProtocolInvariantFailed, "bad changeset");
        assert_eq!(
            status.to_string(),
            "SyncProtocolInvariantFailed: bad changeset"
        );

        let status = Status::file_access(ErrorCode::FileNotFound, "missing", "/tmp/a.db");
        assert!(status.to_string().contains("/tmp/a.db"));
        assert_eq!(status.path(), Some(Path::new("/tmp/a.db")));
        assert_eq!(status.category(), Some(ErrorCategory::FileAccess));
    }

    #[test]
    fn categories() {
        assert_eq!(
            ErrorCode::ConnectionClosed.category(),
            Some(ErrorCategory::Connection)
        );
        assert_eq!(ErrorCode::AuthError.category(), Some(ErrorCategory::Sync));
        assert_eq!(
            ErrorCode::InvalidEncryptionKey.category(),
            Some(ErrorCategory::InvalidArgument)
        );
        assert!(ErrorCode::ConnectTimeout.is_transient());
        assert!(!ErrorCode::AuthError.is_transient());
    }

    #[test]
    fn io_error_conversion() {
        let err = io::Error::from_raw_os_error(2);
        let status = Status::from(err);
        assert_eq!(status.code(), ErrorCode::FileNotFound);
        assert_eq!(status.os_error(), Some(2));

        let err = io::Error::new(io::ErrorKind::Other, "disk on fire");
        let status = Status::from(err);
        assert_eq!(status.code(), ErrorCode::SystemError);
        assert_eq!(status.reason(), "disk on fire");
        assert_eq!(status.os_error(), None);
    }

    #[test]
    fn from_arbitrary_error() {
        let err = "abc".parse::<u32>().unwrap_err();
        let status = Status::from_error(&err);
        assert_eq!(status.code(), ErrorCode::UnknownError);
        assert!(!status.reason().is_empty());

        let original = Status::new(ErrorCode::AuthError, "expired");
        let status = Status::from_error(&original);
        assert_eq!(status, original);
    }

    #[test]
    fn serde_skips_empty_payload() {
        let status = Status::new(ErrorCode::ReadError, "reset by peer");
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("path"));
        assert!(json.contains("read_error"));

        let decoded: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, status);
    }
}
