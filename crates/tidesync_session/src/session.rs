//! The sync session state machine.
//!
//! ## Locking
//!
//! Each session has one mutex guarding its state, progress, completion
//! registry and callback tables. Every public method decides what to do
//! while holding it, collecting the outward work in an [`Effects`] list, and
//! performs that work only after the lock is released. Callbacks may
//! therefore call back into the session freely.
//!
//! ## Generations
//!
//! The generation counter changes on every state transition. Token replies,
//! scheduled reconnects and connection attach/detach requests carry the
//! generation they were issued under; anything older than the current one
//! is discarded.

use crate::auth::AccessTokenProvider;
use crate::classifier::{classify, Decision};
use crate::config::{SessionConfig, SessionStopPolicy};
use crate::connection::{ConnectionState, SyncConnection};
use crate::error::{SessionError, SessionResult};
use crate::progress::{validate_update, ProgressCallback, ProgressNotifiers};
use crate::registry::{CompletionOutcome, CompletionRegistry, CompletionWaiter, ReadyCompletions};
use crate::scheduler::ReconnectScheduler;
use crate::user::{AccessToken, SyncUser};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidesync_protocol::{
    ErrorCode, ProgressDirection, ProgressEstimate, SessionErrorInfo, Status, SyncProgress,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Opaque identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a [`SyncSession`].
///
/// ```text
///             bind             token
///  Inactive ───────► Waiting ────────► Active ◄──┐
///     ▲                ▲                 │       │ bind
///     │                │ resume          │ close │
///     │              Paused ◄─ suspend ──┤       │
///     │                                  ▼       │
///     └────────── logout / terminate ── Dying ───┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Not bound; the initial state.
    #[default]
    Inactive,
    /// Bound, waiting for an access token.
    WaitingForAccessToken,
    /// Bound and attached to a connection.
    Active,
    /// Closing; stays attached until local changes are uploaded.
    Dying,
    /// Stopped after an error or by the application until resumed.
    Paused,
}

impl SessionState {
    /// Returns true if progress updates are accepted in this state.
    pub fn accepts_progress(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Dying)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Inactive => f.write_str("inactive"),
            SessionState::WaitingForAccessToken => f.write_str("waiting_for_access_token"),
            SessionState::Active => f.write_str("active"),
            SessionState::Dying => f.write_str("dying"),
            SessionState::Paused => f.write_str("paused"),
        }
    }
}

/// Application callback receiving session errors and whether the session
/// was terminated by them.
pub type ErrorHandler = Arc<dyn Fn(Status, bool) + Send + Sync + 'static>;

/// Callback receiving `(old, new)` connection states.
pub type ConnectionChangeCallback =
    Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync + 'static>;

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionContext {
    /// Connection the session binds over.
    pub connection: Arc<SyncConnection>,
    /// Source of access tokens.
    pub token_provider: Arc<dyn AccessTokenProvider>,
    /// Runs delayed reconnect attempts.
    pub scheduler: Arc<dyn ReconnectScheduler>,
}

/// Which access token deliveries a session accepts.
#[derive(Debug, Clone, Copy)]
enum TokenReply {
    /// Applies to whatever state the session is in.
    Current,
    /// Reply to the request made in this generation.
    Request(u64),
    /// A user token refresh; only a waiting session takes it.
    Refresh,
}

/// Outward work decided under the session lock.
#[derive(Default)]
struct Effects {
    detach: Option<u64>,
    attach: Option<(AccessToken, u64)>,
    send_token: Option<AccessToken>,
    completions: ReadyCompletions,
    error: Option<(Status, bool)>,
    progress: Vec<(ProgressCallback, ProgressEstimate)>,
    connection_changes: Vec<(ConnectionChangeCallback, ConnectionState, ConnectionState)>,
    request_token: Option<u64>,
    reconnect: Option<(Duration, u64)>,
    token_retry: Option<(Duration, u64)>,
}

struct SessionInner {
    state: SessionState,
    generation: u64,
    progress: SyncProgress,
    // Whether progress has been reported for each direction since the
    // session last became active.
    upload_reported: bool,
    download_reported: bool,
    registry: CompletionRegistry,
    notifiers: ProgressNotifiers,
    connection_callbacks: Vec<(u64, ConnectionChangeCallback)>,
    next_callback_token: u64,
    connection_state: ConnectionState,
    access_token: Option<AccessToken>,
    revive: bool,
    attached: bool,
    reconnect_attempts: u32,
    close_target: Option<u64>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Inactive,
            generation: 0,
            progress: SyncProgress::default(),
            upload_reported: false,
            download_reported: false,
            registry: CompletionRegistry::new(),
            notifiers: ProgressNotifiers::new(),
            connection_callbacks: Vec::new(),
            next_callback_token: 0,
            connection_state: ConnectionState::Disconnected,
            access_token: None,
            revive: false,
            attached: false,
            reconnect_attempts: 0,
            close_target: None,
        }
    }

    fn reported(&self, direction: ProgressDirection) -> bool {
        match direction {
            ProgressDirection::Upload => self.upload_reported,
            ProgressDirection::Download => self.download_reported,
        }
    }

    fn mark_reported(&mut self, direction: ProgressDirection) {
        match direction {
            ProgressDirection::Upload => self.upload_reported = true,
            ProgressDirection::Download => self.download_reported = true,
        }
    }
}

/// A sync session for one server file of one user.
///
/// Sessions are created through [`crate::SessionCoordinator::open_session`]
/// or [`SyncSession::new`], and are always handled through an `Arc`.
pub struct SyncSession {
    id: SessionId,
    config: SessionConfig,
    user: Weak<SyncUser>,
    context: SessionContext,
    error_handler: Option<ErrorHandler>,
    weak_self: Weak<SyncSession>,
    inner: Mutex<SessionInner>,
}

impl SyncSession {
    /// Creates an inactive session.
    pub fn new(
        config: SessionConfig,
        user: &Arc<SyncUser>,
        context: SessionContext,
        error_handler: Option<ErrorHandler>,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|weak_self| Self {
            id: SessionId::new(),
            config,
            user: Arc::downgrade(user),
            context,
            error_handler,
            weak_self: weak_self.clone(),
            inner: Mutex::new(SessionInner::new()),
        });
        debug!(
            session_id = %session.id,
            path = %session.config.server_path,
            "session created"
        );
        session
    }

    /// Returns the session identifier.
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the user, if it still exists.
    pub fn user(&self) -> Option<Arc<SyncUser>> {
        self.user.upgrade()
    }

    /// Returns the connection this session binds over.
    pub fn connection(&self) -> &Arc<SyncConnection> {
        &self.context.connection
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Returns the last accepted progress.
    pub fn progress(&self) -> SyncProgress {
        self.inner.lock().progress
    }

    /// Returns the connection state as last observed by this session.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().connection_state
    }

    /// Number of completion waiters not yet fired.
    pub fn pending_waiters(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// Starts the session. Idempotent.
    ///
    /// An inactive session requests an access token if its user is logged
    /// in; a dying session becomes active again. Never blocks.
    pub fn bind(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            inner.revive = true;
            self.revive_locked(&mut inner, &mut fx);
        }
        self.run(fx);
    }

    /// Restarts the session if it was stopped by a logout or is closing.
    pub fn revive_if_needed(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.revive || inner.state == SessionState::Dying {
                self.revive_locked(&mut inner, &mut fx);
            }
        }
        self.run(fx);
    }

    /// Calls `callback` once everything uploadable right now has been
    /// uploaded, or once the session stops.
    pub fn wait_for_upload_completion(
        &self,
        callback: impl FnOnce(CompletionOutcome) + Send + 'static,
    ) {
        self.wait_for_completion(ProgressDirection::Upload, None, callback);
    }

    /// Calls `callback` once everything downloadable right now has been
    /// downloaded, or once the session stops.
    pub fn wait_for_download_completion(
        &self,
        callback: impl FnOnce(CompletionOutcome) + Send + 'static,
    ) {
        self.wait_for_completion(ProgressDirection::Download, None, callback);
    }

    /// Calls `callback` once `target` bytes have been transferred in
    /// `direction`, or once the session stops.
    pub fn wait_for_transferred(
        &self,
        direction: ProgressDirection,
        target: u64,
        callback: impl FnOnce(CompletionOutcome) + Send + 'static,
    ) {
        self.wait_for_completion(direction, Some(target), callback);
    }

    fn wait_for_completion(
        &self,
        direction: ProgressDirection,
        target: Option<u64>,
        callback: impl FnOnce(CompletionOutcome) + Send + 'static,
    ) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let current = inner.progress.estimate(direction);
            let target = target.unwrap_or(current.transferable);
            let waiter = CompletionWaiter::new(direction, target, callback);

            if inner.state.accepts_progress()
                && inner.reported(direction)
                && current.transferred >= target
            {
                fx.completions.push(waiter, CompletionOutcome::Success);
            } else {
                inner.registry.register(waiter);
            }
        }
        self.run(fx);
    }

    /// Reacts to an error reported by the transport.
    ///
    /// The error is classified and drives a state transition. The error
    /// handler is always notified, after any waiters failed by the error
    /// have been fired.
    pub fn handle_error(&self, info: SessionErrorInfo) {
        let decision = classify(&info);
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let state = inner.state;

            match decision {
                Decision::Terminate => {
                    error!(
                        session_id = %self.id,
                        path = %self.config.server_path,
                        state = %state,
                        error = %info,
                        "session terminated by error"
                    );
                    let failed = inner
                        .registry
                        .flush_all(CompletionOutcome::Failed(info.status.clone()));
                    fx.completions.extend(failed);
                    inner.revive = false;
                    self.deactivate(&mut inner, &mut fx, SessionState::Inactive);
                }
                Decision::Suspend => {
                    warn!(
                        session_id = %self.id,
                        path = %self.config.server_path,
                        state = %state,
                        error = %info,
                        "session suspended by error"
                    );
                    if matches!(
                        state,
                        SessionState::Active
                            | SessionState::Dying
                            | SessionState::WaitingForAccessToken
                    ) {
                        self.deactivate(&mut inner, &mut fx, SessionState::Paused);
                    }
                }
                Decision::Retry => {
                    debug!(
                        session_id = %self.id,
                        state = %state,
                        error = %info,
                        "retrying after error"
                    );
                    match state {
                        SessionState::Active | SessionState::Dying => {
                            inner.reconnect_attempts += 1;
                            let delay = self.config.retry.delay_for_attempt(inner.reconnect_attempts);
                            fx.reconnect = Some((delay, inner.generation));
                        }
                        SessionState::WaitingForAccessToken => {
                            inner.reconnect_attempts += 1;
                            let delay = self.config.retry.delay_for_attempt(inner.reconnect_attempts);
                            fx.token_retry = Some((delay, inner.generation));
                        }
                        SessionState::Inactive | SessionState::Paused => {}
                    }
                }
            }

            fx.error = Some((info.status, decision == Decision::Terminate));
        }
        self.run(fx);
    }

    /// Delivers the result of an access token request.
    ///
    /// A token activates a session waiting for one and is forwarded to the
    /// server by an active session. A failure is handled like a connection
    /// error: transient codes are retried, anything else terminates.
    pub fn handle_access_token(&self, result: Result<AccessToken, Status>) {
        self.on_access_token(TokenReply::Current, result);
    }

    /// Activates the session with a refreshed user token if it is still
    /// waiting for one. Other states ignore the token.
    pub(crate) fn handle_refreshed_token(&self, token: AccessToken) {
        self.on_access_token(TokenReply::Refresh, Ok(token));
    }

    fn on_access_token(&self, reply: TokenReply, result: Result<AccessToken, Status>) {
        let mut fx = Effects::default();
        let failure = {
            let mut inner = self.inner.lock();
            let accepted = match reply {
                TokenReply::Current => true,
                TokenReply::Request(generation) => inner.generation == generation,
                TokenReply::Refresh => inner.state == SessionState::WaitingForAccessToken,
            };
            if !accepted {
                debug!(session_id = %self.id, "discarding stale access token reply");
                return;
            }
            match (inner.state, result) {
                (SessionState::WaitingForAccessToken, Ok(token)) => {
                    self.transition(&mut inner, SessionState::Active);
                    inner.access_token = Some(token.clone());
                    inner.attached = true;
                    fx.attach = Some((token, inner.generation));
                    None
                }
                (SessionState::Active | SessionState::Dying, Ok(token)) => {
                    inner.access_token = Some(token.clone());
                    fx.send_token = Some(token);
                    None
                }
                (SessionState::WaitingForAccessToken, Err(status)) => Some(status),
                (state, _) => {
                    debug!(session_id = %self.id, state = %state, "ignoring access token reply");
                    None
                }
            }
        };

        match failure {
            Some(status) => {
                warn!(session_id = %self.id, error = %status, "access token request failed");
                self.handle_error(SessionErrorInfo::from_connection_status(status));
            }
            None => self.run(fx),
        }
    }

    /// Stops the session because its user logged out.
    ///
    /// A session still waiting for a token simply goes inactive and keeps
    /// its waiters. Any other bound session aborts its waiters. The session
    /// revives on the next login if it was bound.
    pub fn handle_user_logged_out(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let state = inner.state;
            match state {
                SessionState::Inactive => {}
                SessionState::WaitingForAccessToken => {
                    self.deactivate(&mut inner, &mut fx, SessionState::Inactive);
                }
                SessionState::Active => {
                    self.transition(&mut inner, SessionState::Dying);
                    self.abort_and_deactivate(&mut inner, &mut fx, "user logged out");
                }
                SessionState::Dying | SessionState::Paused => {
                    self.abort_and_deactivate(&mut inner, &mut fx, "user logged out");
                }
            }
        }
        self.run(fx);
    }

    /// Revives the session after its user logged in again, if it was bound.
    pub fn handle_user_logged_in(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Inactive && inner.revive {
                self.revive_locked(&mut inner, &mut fx);
            }
        }
        self.run(fx);
    }

    /// Pauses the session until [`SyncSession::resume`] is called. Pending
    /// waiters are kept.
    pub fn suspend(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                SessionState::Active | SessionState::Dying | SessionState::WaitingForAccessToken
            ) {
                self.deactivate(&mut inner, &mut fx, SessionState::Paused);
            }
        }
        self.run(fx);
    }

    /// Resumes a paused session by requesting a fresh access token.
    pub fn resume(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Paused {
                inner.reconnect_attempts = 0;
                if self.user_logged_in() {
                    self.transition(&mut inner, SessionState::WaitingForAccessToken);
                    fx.request_token = Some(inner.generation);
                } else {
                    self.transition(&mut inner, SessionState::Inactive);
                }
            }
        }
        self.run(fx);
    }

    /// Closes the session according to its stop policy.
    pub fn close(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let policy = self.config.stop_policy;
            if policy == SessionStopPolicy::LiveIndefinitely {
                debug!(session_id = %self.id, "close ignored, session lives indefinitely");
            } else {
                inner.revive = false;
                let state = inner.state;
                match state {
                    SessionState::Inactive | SessionState::Dying => {}
                    SessionState::Active
                        if policy == SessionStopPolicy::AfterChangesUploaded
                            && !inner.progress.estimate(ProgressDirection::Upload).is_complete() =>
                    {
                        inner.close_target = Some(inner.progress.uploadable);
                        self.transition(&mut inner, SessionState::Dying);
                    }
                    SessionState::Active
                    | SessionState::WaitingForAccessToken
                    | SessionState::Paused => {
                        self.abort_and_deactivate(&mut inner, &mut fx, "session closed");
                    }
                }
            }
        }
        self.run(fx);
    }

    /// Stops the session at once regardless of stop policy, aborting every
    /// waiter.
    pub fn force_close(&self) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            inner.revive = false;
            self.abort_and_deactivate(&mut inner, &mut fx, "session closed");
        }
        self.run(fx);
    }

    /// Applies a progress report from the transport.
    ///
    /// Accepted only while active or dying. Rejected updates leave the
    /// stored progress untouched.
    pub fn handle_progress_update(
        &self,
        direction: ProgressDirection,
        transferred: u64,
        transferable: u64,
    ) -> SessionResult<()> {
        let proposed = ProgressEstimate::new(transferred, transferable);
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if !inner.state.accepts_progress() {
                debug!(
                    session_id = %self.id,
                    state = %inner.state,
                    %direction,
                    "progress update while not transferring"
                );
                return Err(SessionError::NotAcceptingProgress { state: inner.state });
            }

            let previous = inner.progress.estimate(direction);
            if let Err(err) = validate_update(direction, previous, proposed) {
                if err.is_programming_error() {
                    error!(session_id = %self.id, error = %err, "invalid progress update");
                } else {
                    warn!(session_id = %self.id, error = %err, "progress update rejected");
                }
                return Err(err);
            }

            inner.progress.set(direction, proposed);
            inner.mark_reported(direction);
            let ready = inner.registry.on_progress(direction, transferred);
            fx.completions.extend(ready);
            fx.progress = inner.notifiers.on_update(direction, proposed);

            if inner.state == SessionState::Dying
                && direction == ProgressDirection::Upload
                && inner.close_target.is_some_and(|target| transferred >= target)
            {
                debug!(session_id = %self.id, "changes uploaded, finishing close");
                self.abort_and_deactivate(&mut inner, &mut fx, "session closed");
            }
        }
        self.run(fx);
        Ok(())
    }

    /// Records a connectivity change of the session's connection.
    ///
    /// A successful connection resets the reconnect backoff.
    pub fn handle_connection_state_change(&self, old_state: ConnectionState, new_state: ConnectionState) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            self.set_connection_state(&mut inner, &mut fx, new_state);
        }
        if old_state != new_state {
            debug!(
                session_id = %self.id,
                from = %old_state,
                to = %new_state,
                "session observed connection change"
            );
        }
        self.run(fx);
    }

    /// Registers a progress notifier and returns its token.
    ///
    /// If progress has been reported in this direction the notifier is
    /// called once right away.
    pub fn register_progress_notifier(
        &self,
        callback: impl Fn(ProgressEstimate) + Send + Sync + 'static,
        direction: ProgressDirection,
        is_streaming: bool,
    ) -> u64 {
        let mut fx = Effects::default();
        let token = {
            let mut inner = self.inner.lock();
            let current = inner
                .reported(direction)
                .then(|| inner.progress.estimate(direction));
            let (token, immediate) =
                inner
                    .notifiers
                    .register(Arc::new(callback), direction, is_streaming, current);
            fx.progress.extend(immediate);
            token
        };
        self.run(fx);
        token
    }

    /// Removes a progress notifier. Unknown tokens are ignored.
    pub fn unregister_progress_notifier(&self, token: u64) {
        self.inner.lock().notifiers.unregister(token);
    }

    /// Registers a callback for connection changes and returns its token.
    pub fn register_connection_change_callback(
        &self,
        callback: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_callback_token += 1;
        let token = inner.next_callback_token;
        inner.connection_callbacks.push((token, Arc::new(callback)));
        token
    }

    /// Removes a connection change callback. Unknown tokens are ignored.
    pub fn unregister_connection_change_callback(&self, token: u64) {
        self.inner
            .lock()
            .connection_callbacks
            .retain(|(t, _)| *t != token);
    }

    fn user_logged_in(&self) -> bool {
        self.user
            .upgrade()
            .is_some_and(|user| user.is_logged_in())
    }

    fn revive_locked(&self, inner: &mut SessionInner, fx: &mut Effects) {
        let state = inner.state;
        match state {
            SessionState::Inactive => {
                if self.user_logged_in() {
                    inner.reconnect_attempts = 0;
                    self.transition(inner, SessionState::WaitingForAccessToken);
                    fx.request_token = Some(inner.generation);
                } else {
                    debug!(session_id = %self.id, "bind deferred until user logs in");
                }
            }
            SessionState::Dying => {
                inner.close_target = None;
                self.transition(inner, SessionState::Active);
            }
            SessionState::WaitingForAccessToken | SessionState::Active | SessionState::Paused => {}
        }
    }

    fn transition(&self, inner: &mut SessionInner, to: SessionState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        info!(
            session_id = %self.id,
            path = %self.config.server_path,
            from = %from,
            to = %to,
            "session state changed"
        );
    }

    /// Leaves the bound states, detaching from the connection.
    fn deactivate(&self, inner: &mut SessionInner, fx: &mut Effects, to: SessionState) {
        if inner.state != to {
            self.transition(inner, to);
        }
        if inner.attached {
            inner.attached = false;
            fx.detach = Some(inner.generation);
        }
        inner.access_token = None;
        inner.upload_reported = false;
        inner.download_reported = false;
        inner.close_target = None;
        if to == SessionState::Inactive {
            inner.reconnect_attempts = 0;
        }
    }

    fn abort_and_deactivate(&self, inner: &mut SessionInner, fx: &mut Effects, reason: &str) {
        let aborted = inner
            .registry
            .flush_all(CompletionOutcome::Aborted(Status::aborted(reason)));
        fx.completions.extend(aborted);
        self.deactivate(inner, fx, SessionState::Inactive);
    }

    fn set_connection_state(&self, inner: &mut SessionInner, fx: &mut Effects, new_state: ConnectionState) {
        let old_state = inner.connection_state;
        if old_state == new_state {
            return;
        }
        inner.connection_state = new_state;
        if new_state == ConnectionState::Connected {
            inner.reconnect_attempts = 0;
        }
        for (_, callback) in &inner.connection_callbacks {
            fx.connection_changes
                .push((Arc::clone(callback), old_state, new_state));
        }
    }

    fn reconnect_now(&self, generation: u64) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || !inner.state.accepts_progress() {
                debug!(session_id = %self.id, "dropping outdated reconnect");
                return;
            }
            let Some(token) = inner.access_token.clone() else {
                return;
            };
            // Rebind under a fresh generation so older requests stay stale.
            inner.generation += 1;
            fx.detach = Some(inner.generation);
            fx.attach = Some((token, inner.generation));
            inner.attached = true;
            info!(
                session_id = %self.id,
                attempt = inner.reconnect_attempts,
                "reconnecting session"
            );
        }
        self.run(fx);
    }

    fn retry_token_request(&self, generation: u64) {
        let mut fx = Effects::default();
        {
            let inner = self.inner.lock();
            if inner.generation != generation
                || inner.state != SessionState::WaitingForAccessToken
            {
                return;
            }
            fx.request_token = Some(inner.generation);
        }
        self.run(fx);
    }

    fn run(&self, fx: Effects) {
        let connection = &self.context.connection;

        if let Some(epoch) = fx.detach {
            connection.detach(self.id, epoch);
            self.observe_connection(ConnectionState::Disconnected);
        }
        if let Some((token, epoch)) = fx.attach {
            if let Some(session) = self.weak_self.upgrade() {
                if let Some(state) =
                    connection.attach(&session, &self.config.server_path, &token, epoch)
                {
                    self.observe_connection(state);
                }
            }
        }
        if let Some(token) = fx.send_token {
            connection.send_access_token(self.id, &token);
        }

        fx.completions.fire();

        if let Some((status, is_fatal)) = fx.error {
            if let Some(handler) = &self.error_handler {
                handler(status, is_fatal);
            }
        }
        for (callback, estimate) in fx.progress {
            callback(estimate);
        }
        for (callback, old_state, new_state) in fx.connection_changes {
            callback(old_state, new_state);
        }

        if let Some(generation) = fx.request_token {
            self.request_token(generation);
        }
        if let Some((delay, generation)) = fx.reconnect {
            let weak = self.weak_self.clone();
            self.context.scheduler.schedule(
                delay,
                Box::new(move || {
                    if let Some(session) = weak.upgrade() {
                        session.reconnect_now(generation);
                    }
                }),
            );
        }
        if let Some((delay, generation)) = fx.token_retry {
            let weak = self.weak_self.clone();
            self.context.scheduler.schedule(
                delay,
                Box::new(move || {
                    if let Some(session) = weak.upgrade() {
                        session.retry_token_request(generation);
                    }
                }),
            );
        }
    }

    fn observe_connection(&self, state: ConnectionState) {
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            self.set_connection_state(&mut inner, &mut fx, state);
        }
        for (callback, old_state, new_state) in fx.connection_changes {
            callback(old_state, new_state);
        }
    }

    fn request_token(&self, generation: u64) {
        let Some(user) = self.user.upgrade() else {
            self.on_access_token(
                TokenReply::Request(generation),
                Err(Status::new(ErrorCode::ClientUserNotFound, "user no longer exists")),
            );
            return;
        };
        let weak = self.weak_self.clone();
        debug!(session_id = %self.id, user = %user.identity(), "requesting access token");
        self.context.token_provider.request_access_token(
            &user,
            Box::new(move |result| {
                if let Some(session) = weak.upgrade() {
                    session.on_access_token(TokenReply::Request(generation), result);
                }
            }),
        );
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let pending = inner
            .registry
            .flush_all(CompletionOutcome::Aborted(Status::aborted("session destroyed")));
        if !pending.is_empty() {
            debug!(session_id = %self.id, waiters = pending.len(), "aborting waiters of destroyed session");
        }
        pending.fire();
        // Also forgets the epoch of a session that was already detached.
        self.context.connection.release(self.id);
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("id", &self.id)
            .field("path", &self.config.server_path)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
impl SyncSession {
    pub(crate) fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.inner.lock().attached
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserTokenProvider;
    use crate::config::RetryConfig;
    use crate::connection::ServerEndpoint;
    use crate::scheduler::ManualReconnectScheduler;
    use crate::transport::{RecordingTransport, TransportCommand};
    use tidesync_protocol::ProtocolErrorAction;

    struct Fixture {
        user: Arc<SyncUser>,
        transport: Arc<RecordingTransport>,
        scheduler: Arc<ManualReconnectScheduler>,
        errors: Arc<Mutex<Vec<(Status, bool)>>>,
        session: Arc<SyncSession>,
    }

    fn fixture_with(config: SessionConfig) -> Fixture {
        let user = SyncUser::new("alice", AccessToken::new("t0"));
        let transport = Arc::new(RecordingTransport::new());
        let scheduler = Arc::new(ManualReconnectScheduler::new());
        let connection = SyncConnection::new(ServerEndpoint::from_config(&config), transport.clone());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handler: ErrorHandler = Arc::new(move |status, fatal| sink.lock().push((status, fatal)));
        let context = SessionContext {
            connection,
            token_provider: Arc::new(UserTokenProvider),
            scheduler: scheduler.clone(),
        };
        let session = SyncSession::new(config, &user, context, Some(handler));
        Fixture {
            user,
            transport,
            scheduler,
            errors,
            session,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SessionConfig::new("ws://localhost:9090", "/notes"))
    }

    fn outcomes() -> (Arc<Mutex<Vec<CompletionOutcome>>>, impl Fn() -> Box<dyn FnOnce(CompletionOutcome) + Send>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let make = move || {
            let sink = Arc::clone(&sink);
            Box::new(move |outcome| sink.lock().push(outcome)) as Box<dyn FnOnce(CompletionOutcome) + Send>
        };
        (seen, make)
    }

    #[test]
    fn bind_with_sync_provider_activates() {
        let f = fixture();
        f.session.bind();

        assert_eq!(f.session.state(), SessionState::Active);
        assert!(f.session.is_attached());
        assert_eq!(f.session.connection_state(), ConnectionState::Connecting);
        let commands = f.transport.commands();
        assert!(matches!(commands[0], TransportCommand::Connect(_)));
        assert!(matches!(commands[1], TransportCommand::Bind { .. }));
        assert!(matches!(commands[2], TransportCommand::AccessToken { .. }));
    }

    #[test]
    fn bind_is_idempotent() {
        let f = fixture();
        f.session.bind();
        let generation = f.session.generation();
        f.session.bind();
        f.session.bind();
        assert_eq!(f.session.generation(), generation);
        assert_eq!(f.transport.count(|c| matches!(c, TransportCommand::Bind { .. })), 1);
    }

    #[test]
    fn bind_without_login_stays_inactive() {
        let f = fixture();
        f.user.log_out();
        f.session.bind();
        assert_eq!(f.session.state(), SessionState::Inactive);

        f.user.log_in(AccessToken::new("t1"));
        f.session.handle_user_logged_in();
        assert_eq!(f.session.state(), SessionState::Active);
    }

    #[test]
    fn transient_error_schedules_reconnect() {
        let f = fixture();
        f.session.bind();
        let (seen, make) = outcomes();
        f.session.wait_for_transferred(ProgressDirection::Upload, 10, make());

        f.session
            .handle_error(SessionErrorInfo::transient(Status::new(ErrorCode::ConnectionClosed, "reset")));
        assert_eq!(f.session.state(), SessionState::Active);
        assert_eq!(f.scheduler.pending_count(), 1);
        assert_eq!(f.session.reconnect_attempts(), 1);
        assert!(seen.lock().is_empty());
        assert_eq!(f.errors.lock().len(), 1);
        assert!(!f.errors.lock()[0].1);

        f.transport.take_commands();
        f.scheduler.run_pending();
        let commands = f.transport.commands();
        assert!(commands.iter().any(|c| matches!(c, TransportCommand::Unbind(_))));
        assert!(commands.iter().any(|c| matches!(c, TransportCommand::Bind { .. })));
        assert!(f.session.is_attached());

        f.session
            .handle_connection_state_change(ConnectionState::Connecting, ConnectionState::Connected);
        assert_eq!(f.session.reconnect_attempts(), 0);
    }

    #[test]
    fn transient_errors_keep_retrying_with_capped_backoff() {
        let retry = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(400))
            .with_jitter(false);
        let f = fixture_with(SessionConfig::new("ws://localhost:9090", "/notes").with_retry(retry));
        f.session.bind();
        let transient = SessionErrorInfo::transient(Status::new(ErrorCode::ReadError, "eof"));

        for attempt in 1..=12 {
            f.session.handle_error(transient.clone());
            assert_eq!(f.session.state(), SessionState::Active);
            assert_eq!(f.scheduler.pending_count(), attempt);
        }
        assert_eq!(f.session.reconnect_attempts(), 12);
        let delays = f.scheduler.delays();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[11], Duration::from_millis(400));
        assert!(f.errors.lock().iter().all(|(_, fatal)| !fatal));
    }

    #[test]
    fn outdated_reconnect_is_dropped() {
        let f = fixture();
        f.session.bind();
        f.session
            .handle_error(SessionErrorInfo::transient(Status::new(ErrorCode::ConnectionClosed, "reset")));
        f.session.suspend();
        f.transport.take_commands();

        f.scheduler.run_pending();
        assert!(f.transport.commands().is_empty());
        assert_eq!(f.session.state(), SessionState::Paused);
    }

    #[test]
    fn errors_in_inactive_only_notify() {
        let f = fixture();
        f.session.handle_error(SessionErrorInfo::protocol_violation(Status::new(
            ErrorCode::SyncProtocolInvariantFailed,
            "bad",
        )));
        assert_eq!(f.session.state(), SessionState::Inactive);
        assert_eq!(f.errors.lock().len(), 1);
    }

    #[test]
    fn unrecognized_action_reports_fatal() {
        let f = fixture();
        f.session.bind();
        f.session.handle_error(
            SessionErrorInfo::new(Status::new(ErrorCode::UnknownError, "?"), false)
                .with_action(ProtocolErrorAction::from_code(99)),
        );
        assert_eq!(f.session.state(), SessionState::Inactive);
        assert!(f.errors.lock()[0].1);
    }

    #[test]
    fn close_after_changes_uploaded_waits_for_upload() {
        let f = fixture();
        f.session.bind();
        f.session
            .handle_progress_update(ProgressDirection::Upload, 10, 100)
            .unwrap();
        let (seen, make) = outcomes();
        f.session.wait_for_transferred(ProgressDirection::Download, 500, make());

        f.session.close();
        assert_eq!(f.session.state(), SessionState::Dying);

        f.session
            .handle_progress_update(ProgressDirection::Upload, 100, 100)
            .unwrap();
        assert_eq!(f.session.state(), SessionState::Inactive);
        assert!(seen.lock()[0].is_aborted());
        assert!(f.transport.commands().iter().any(|c| matches!(c, TransportCommand::Unbind(_))));
    }

    #[test]
    fn close_immediately_aborts() {
        let f = fixture_with(
            SessionConfig::new("ws://localhost:9090", "/notes")
                .with_stop_policy(SessionStopPolicy::Immediately),
        );
        f.session.bind();
        let (seen, make) = outcomes();
        f.session.wait_for_upload_completion(make());
        f.session.close();
        assert_eq!(f.session.state(), SessionState::Inactive);
        assert!(seen.lock()[0].is_aborted());

        f.session.revive_if_needed();
        assert_eq!(f.session.state(), SessionState::Inactive);
    }

    #[test]
    fn live_indefinitely_ignores_close() {
        let f = fixture_with(
            SessionConfig::new("ws://localhost:9090", "/notes")
                .with_stop_policy(SessionStopPolicy::LiveIndefinitely),
        );
        f.session.bind();
        f.session.close();
        assert_eq!(f.session.state(), SessionState::Active);
    }

    #[test]
    fn bind_revives_dying_session() {
        let f = fixture();
        f.session.bind();
        f.session
            .handle_progress_update(ProgressDirection::Upload, 0, 100)
            .unwrap();
        f.session.close();
        assert_eq!(f.session.state(), SessionState::Dying);
        f.session.bind();
        assert_eq!(f.session.state(), SessionState::Active);
    }

    #[test]
    fn progress_rejected_while_inactive() {
        let f = fixture();
        let err = f
            .session
            .handle_progress_update(ProgressDirection::Download, 1, 2)
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::NotAcceptingProgress {
                state: SessionState::Inactive
            }
        );
    }

    #[test]
    fn notifiers_and_connection_callbacks() {
        let f = fixture();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let token = f
            .session
            .register_connection_change_callback(move |old, new| sink.lock().push((old, new)));

        let estimates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&estimates);
        f.session
            .register_progress_notifier(move |e| sink.lock().push(e), ProgressDirection::Download, true);

        f.session.bind();
        f.session
            .handle_progress_update(ProgressDirection::Download, 5, 10)
            .unwrap();

        assert_eq!(
            *changes.lock(),
            vec![(ConnectionState::Disconnected, ConnectionState::Connecting)]
        );
        assert_eq!(*estimates.lock(), vec![ProgressEstimate::new(5, 10)]);

        f.session.unregister_connection_change_callback(token);
        f.session.force_close();
        assert_eq!(changes.lock().len(), 1);
    }

    #[test]
    fn stale_token_reply_is_discarded() {
        let f = fixture();
        f.session.bind();
        let stale = f.session.generation() - 1;
        f.session.on_access_token(TokenReply::Request(stale), Ok(AccessToken::new("old")));
        assert_eq!(f.session.state(), SessionState::Active);
        assert_eq!(
            f.transport
                .count(|c| matches!(c, TransportCommand::AccessToken { .. })),
            1
        );
    }

    #[test]
    fn drop_aborts_waiters_and_detaches() {
        let f = fixture();
        f.session.bind();
        let (seen, make) = outcomes();
        f.session.wait_for_transferred(ProgressDirection::Upload, 100, make());
        let connection = Arc::clone(f.session.connection());

        drop(f.session);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].status().reason(), "session destroyed");
        assert_eq!(connection.session_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn dropped_sessions_leave_no_epochs_behind() {
        let user = SyncUser::new("alice", AccessToken::new("t0"));
        let transport = Arc::new(RecordingTransport::new());
        let config = SessionConfig::new("ws://localhost:9090", "/notes");
        let connection = SyncConnection::new(ServerEndpoint::from_config(&config), transport);
        let scheduler = Arc::new(ManualReconnectScheduler::new());

        for _ in 0..100 {
            let context = SessionContext {
                connection: Arc::clone(&connection),
                token_provider: Arc::new(UserTokenProvider),
                scheduler: scheduler.clone(),
            };
            let session = SyncSession::new(config.clone(), &user, context, None);
            session.bind();
            session.force_close();
            drop(session);
        }

        assert_eq!(connection.session_count(), 0);
        assert_eq!(connection.tracked_epochs(), 0);
    }

    #[test]
    fn refreshed_token_only_reaches_waiting_sessions() {
        let f = fixture();
        f.session.bind();
        let generation = f.session.generation();

        f.session.handle_refreshed_token(AccessToken::new("t1"));
        assert_eq!(f.session.generation(), generation);
        assert_eq!(
            f.transport
                .count(|c| matches!(c, TransportCommand::AccessToken { .. })),
            1
        );

        f.session.force_close();
        f.session.handle_refreshed_token(AccessToken::new("t2"));
        assert_eq!(f.session.state(), SessionState::Inactive);
        assert!(!f.session.is_attached());
    }
}
