//! Test fixtures and session helpers.
//!
//! Provides a harness wiring a [`SessionCoordinator`] to collaborators the
//! test controls, and probes recording what callbacks received.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidesync_protocol::Status;
use tidesync_session::{
    AccessToken, AccessTokenProvider, AccessTokenReply, CompletionOutcome, CoordinatorConfig,
    ErrorHandler, ManualReconnectScheduler, RecordingTransport, SessionConfig, SessionCoordinator,
    SessionState, SyncSession, SyncUser,
};

/// Server URL used by harness sessions.
pub const TEST_SERVER_URL: &str = "wss://sync.example.com";

/// A token provider that holds requests until the test answers them.
#[derive(Default)]
pub struct ManualTokenProvider {
    pending: Mutex<Vec<(Arc<SyncUser>, AccessTokenReply)>>,
    requests: AtomicUsize,
    auto_reply: AtomicBool,
}

impl ManualTokenProvider {
    /// Creates a provider holding every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// When enabled, requests are answered at once with the user's token.
    pub fn set_auto_reply(&self, enabled: bool) {
        self.auto_reply.store(enabled, Ordering::SeqCst);
    }

    /// Total number of requests received.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of unanswered requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Answers the oldest request. Returns false if none was pending.
    pub fn reply_next(&self, result: Result<AccessToken, Status>) -> bool {
        let next = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            }
        };
        match next {
            Some((_, reply)) => {
                reply(result);
                true
            }
            None => false,
        }
    }

    /// Answers every pending request with the requesting user's current
    /// token. Returns the number answered.
    pub fn grant_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let count = pending.len();
        for (user, reply) in pending {
            reply(token_or_error(&user));
        }
        count
    }

    /// Fails every pending request with `status`.
    pub fn fail_all(&self, status: Status) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let count = pending.len();
        for (_, reply) in pending {
            reply(Err(status.clone()));
        }
        count
    }
}

impl AccessTokenProvider for ManualTokenProvider {
    fn request_access_token(&self, user: &Arc<SyncUser>, reply: AccessTokenReply) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.auto_reply.load(Ordering::SeqCst) {
            reply(token_or_error(user));
        } else {
            self.pending.lock().push((Arc::clone(user), reply));
        }
    }
}

fn token_or_error(user: &SyncUser) -> Result<AccessToken, Status> {
    user.access_token().ok_or_else(|| {
        Status::new(
            tidesync_protocol::ErrorCode::ClientUserNotLoggedIn,
            "user logged out",
        )
    })
}

/// Collects completion outcomes by label.
#[derive(Clone, Default)]
pub struct CompletionProbe {
    outcomes: Arc<Mutex<Vec<(&'static str, CompletionOutcome)>>>,
}

impl CompletionProbe {
    /// Creates an empty probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a completion callback recording under `label`.
    pub fn callback(&self, label: &'static str) -> impl FnOnce(CompletionOutcome) + Send + 'static {
        let outcomes = Arc::clone(&self.outcomes);
        move |outcome| outcomes.lock().push((label, outcome))
    }

    /// Every recorded outcome, in firing order.
    pub fn outcomes(&self) -> Vec<(&'static str, CompletionOutcome)> {
        self.outcomes.lock().clone()
    }

    /// Labels in firing order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.outcomes.lock().iter().map(|(label, _)| *label).collect()
    }

    /// Outcomes recorded under `label`.
    pub fn outcomes_for(&self, label: &str) -> Vec<CompletionOutcome> {
        self.outcomes
            .lock()
            .iter()
            .filter(|(l, _)| *l == label)
            .map(|(_, outcome)| outcome.clone())
            .collect()
    }

    /// Number of recorded outcomes.
    pub fn count(&self) -> usize {
        self.outcomes.lock().len()
    }
}

/// Records calls to a session error handler.
#[derive(Clone, Default)]
pub struct ErrorProbe {
    events: Arc<Mutex<Vec<(Status, bool)>>>,
}

impl ErrorProbe {
    /// Creates an empty probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an error handler recording into this probe.
    pub fn handler(&self) -> ErrorHandler {
        let events = Arc::clone(&self.events);
        Arc::new(move |status, is_fatal| events.lock().push((status, is_fatal)))
    }

    /// Every recorded `(status, is_fatal)` pair.
    pub fn events(&self) -> Vec<(Status, bool)> {
        self.events.lock().clone()
    }

    /// Number of recorded errors.
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

/// A coordinator wired to collaborators the test drives by hand.
pub struct TestHarness {
    /// The sync user.
    pub user: Arc<SyncUser>,
    /// Records outbound transport commands.
    pub transport: Arc<RecordingTransport>,
    /// Holds token requests until answered.
    pub tokens: Arc<ManualTokenProvider>,
    /// Holds reconnect attempts until run.
    pub scheduler: Arc<ManualReconnectScheduler>,
    /// Error handler calls of every harness session.
    pub errors: ErrorProbe,
    /// The coordinator under test.
    pub coordinator: Arc<SessionCoordinator>,
}

impl TestHarness {
    /// Creates a harness with connection multiplexing enabled.
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    /// Creates a harness with the given coordinator configuration.
    pub fn with_config(config: CoordinatorConfig) -> Self {
        let user = SyncUser::new("test-user", AccessToken::new("token-0"));
        let transport = Arc::new(RecordingTransport::new());
        let tokens = Arc::new(ManualTokenProvider::new());
        let scheduler = Arc::new(ManualReconnectScheduler::new());
        let coordinator = SessionCoordinator::builder(Arc::clone(&user), transport.clone())
            .token_provider(tokens.clone())
            .scheduler(scheduler.clone())
            .config(config)
            .build();
        Self {
            user,
            transport,
            tokens,
            scheduler,
            errors: ErrorProbe::new(),
            coordinator,
        }
    }

    /// Returns the default session configuration for `path`.
    pub fn config(&self, path: &str) -> SessionConfig {
        SessionConfig::new(TEST_SERVER_URL, path)
    }

    /// Opens an inactive session for `path`.
    pub fn open(&self, path: &str) -> Arc<SyncSession> {
        self.open_with(self.config(path))
    }

    /// Opens an inactive session with a custom configuration.
    pub fn open_with(&self, config: SessionConfig) -> Arc<SyncSession> {
        self.coordinator
            .open_session(config, Some(self.errors.handler()))
            .expect("Failed to open session")
    }

    /// Binds a session and grants its token, leaving it active.
    pub fn activate(&self, session: &Arc<SyncSession>) {
        session.bind();
        self.tokens.grant_all();
        assert_eq!(session.state(), SessionState::Active, "session should be active");
    }

    /// Opens and activates a session for `path`.
    pub fn active_session(&self, path: &str) -> Arc<SyncSession> {
        let session = self.open(path);
        self.activate(&session);
        session
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
