//! # TideSync Protocol
//!
//! Value types shared between the TideSync session layer and its
//! transport collaborators.
//!
//! This crate provides:
//! - `Status` and `ErrorCode`, the tagged-union error value
//! - `SessionErrorInfo` and `ProtocolErrorAction` for server-reported errors
//! - `ProgressDirection`, `ProgressEstimate` and `SyncProgress`
//!
//! This is a pure value crate with no I/O and no locking. The wire encoding
//! of these values belongs to the transport.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error_info;
mod progress;
mod status;

pub use error_info::{ProtocolErrorAction, SessionErrorInfo};
pub use progress::{ProgressDirection, ProgressEstimate, SyncProgress};
pub use status::{ErrorCategory, ErrorCode, Status};
