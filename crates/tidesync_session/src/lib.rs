//! # TideSync Session
//!
//! Client-side orchestration of sync sessions.
//!
//! This crate provides:
//! - The session state machine (inactive → waiting for token → active)
//! - Upload/download completion waiters
//! - Error classification into retry, suspend or terminate
//! - Shared connections and a per-user session coordinator
//! - Progress notifiers and "open after download" tasks
//!
//! ## Architecture
//!
//! The crate sits between the application and a transport:
//! 1. The application opens sessions through a [`SessionCoordinator`] and
//!    binds them
//! 2. Sessions obtain access tokens and attach to a [`SyncConnection`]
//! 3. The transport reports connectivity, progress and errors back
//!
//! Network I/O never happens here. Outbound work goes through the
//! [`SyncTransport`], [`AccessTokenProvider`] and [`ReconnectScheduler`]
//! traits.
//!
//! ## Key Invariants
//!
//! - Every completion waiter fires exactly once
//! - Progress never moves backwards
//! - Callbacks never run while a session lock is held
//! - Transient errors never drop pending waiters

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod async_open;
mod auth;
mod classifier;
mod config;
mod connection;
mod coordinator;
mod error;
mod progress;
mod registry;
mod scheduler;
mod session;
mod transport;
mod user;

pub use async_open::{AsyncOpenCallback, AsyncOpenTask};
pub use auth::{AccessTokenProvider, AccessTokenReply, UserTokenProvider};
pub use classifier::{classify, Decision};
pub use config::{CoordinatorConfig, RetryConfig, SessionConfig, SessionStopPolicy, SslConfig};
pub use connection::{ConnectionState, ServerEndpoint, SyncConnection};
pub use coordinator::{CoordinatorBuilder, SessionCoordinator};
pub use error::{SessionError, SessionResult};
pub use progress::{validate_update, ProgressCallback, ProgressNotifiers};
pub use registry::{
    CompletionCallback, CompletionOutcome, CompletionRegistry, CompletionWaiter, ReadyCompletions,
};
pub use scheduler::{
    ManualReconnectScheduler, ReconnectScheduler, ScheduledTask, ThreadReconnectScheduler,
    TokioReconnectScheduler,
};
pub use session::{
    ConnectionChangeCallback, ErrorHandler, SessionContext, SessionId, SessionState, SyncSession,
};
pub use transport::{RecordingTransport, SyncTransport, TransportCommand};
pub use user::{AccessToken, SyncUser, UserObserver, UserState};

pub use tidesync_protocol::{
    ErrorCategory, ErrorCode, ProgressDirection, ProgressEstimate, ProtocolErrorAction,
    SessionErrorInfo, Status, SyncProgress,
};
