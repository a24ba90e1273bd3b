//! Fleet-level session management for one user.

use crate::auth::{AccessTokenProvider, UserTokenProvider};
use crate::config::{CoordinatorConfig, SessionConfig};
use crate::connection::{ServerEndpoint, SyncConnection};
use crate::error::{SessionError, SessionResult};
use crate::scheduler::{ReconnectScheduler, ThreadReconnectScheduler, TokioReconnectScheduler};
use crate::session::{ErrorHandler, SessionContext, SyncSession};
use crate::transport::SyncTransport;
use crate::user::{AccessToken, SyncUser, UserObserver, UserState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds a [`SessionCoordinator`].
pub struct CoordinatorBuilder {
    user: Arc<SyncUser>,
    transport: Arc<dyn SyncTransport>,
    token_provider: Option<Arc<dyn AccessTokenProvider>>,
    scheduler: Option<Arc<dyn ReconnectScheduler>>,
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    /// Starts a builder for `user`'s sessions over `transport`.
    pub fn new(user: Arc<SyncUser>, transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            user,
            transport,
            token_provider: None,
            scheduler: None,
            config: CoordinatorConfig::default(),
        }
    }

    /// Sets the access token provider. Defaults to [`UserTokenProvider`].
    pub fn token_provider(mut self, provider: Arc<dyn AccessTokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Sets the reconnect scheduler.
    ///
    /// Defaults to the current tokio runtime when there is one, and to a
    /// thread per delayed task otherwise.
    pub fn scheduler(mut self, scheduler: Arc<dyn ReconnectScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sets the coordinator configuration.
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the coordinator and registers it as an observer of the user.
    pub fn build(self) -> Arc<SessionCoordinator> {
        let token_provider = self
            .token_provider
            .unwrap_or_else(|| Arc::new(UserTokenProvider));
        let scheduler = self.scheduler.unwrap_or_else(|| {
            match TokioReconnectScheduler::from_current() {
                Some(tokio) => Arc::new(tokio) as Arc<dyn ReconnectScheduler>,
                None => Arc::new(ThreadReconnectScheduler),
            }
        });

        let coordinator = Arc::new(SessionCoordinator {
            user: self.user,
            transport: self.transport,
            token_provider,
            scheduler,
            config: self.config,
            inner: Mutex::new(CoordinatorInner::default()),
        });
        let observer: Arc<dyn UserObserver> = coordinator.clone();
        coordinator.user.add_observer(Arc::downgrade(&observer));
        coordinator
    }
}

#[derive(Default)]
struct CoordinatorInner {
    sessions: HashMap<String, Arc<SyncSession>>,
    connections: HashMap<ServerEndpoint, Arc<SyncConnection>>,
    shut_down: bool,
}

/// Owns the sessions of one user and the connections they share.
///
/// User events are broadcast to every member session. Broadcasts work on a
/// snapshot of the membership, so sessions may be opened or removed while
/// one is in progress.
pub struct SessionCoordinator {
    user: Arc<SyncUser>,
    transport: Arc<dyn SyncTransport>,
    token_provider: Arc<dyn AccessTokenProvider>,
    scheduler: Arc<dyn ReconnectScheduler>,
    config: CoordinatorConfig,
    inner: Mutex<CoordinatorInner>,
}

impl SessionCoordinator {
    /// Starts building a coordinator.
    pub fn builder(user: Arc<SyncUser>, transport: Arc<dyn SyncTransport>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(user, transport)
    }

    /// Returns the user.
    pub fn user(&self) -> &Arc<SyncUser> {
        &self.user
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the session for `config.server_path`, creating it if needed.
    ///
    /// A new session starts inactive; call [`SyncSession::bind`] to start
    /// syncing. When the session already exists, `error_handler` is ignored.
    pub fn open_session(
        &self,
        config: SessionConfig,
        error_handler: Option<ErrorHandler>,
    ) -> SessionResult<Arc<SyncSession>> {
        config.validate()?;

        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(SessionError::CoordinatorShutDown);
        }
        if self.user.state() == UserState::Removed {
            return Err(SessionError::UserUnavailable(self.user.identity().to_string()));
        }
        if let Some(existing) = inner.sessions.get(&config.server_path) {
            return Ok(Arc::clone(existing));
        }

        let endpoint = ServerEndpoint::from_config(&config);
        let connection = if self.config.multiplex_sessions {
            Arc::clone(
                inner
                    .connections
                    .entry(endpoint.clone())
                    .or_insert_with(|| SyncConnection::new(endpoint, Arc::clone(&self.transport))),
            )
        } else {
            SyncConnection::new(endpoint, Arc::clone(&self.transport))
        };

        let path = config.server_path.clone();
        let context = SessionContext {
            connection,
            token_provider: Arc::clone(&self.token_provider),
            scheduler: Arc::clone(&self.scheduler),
        };
        let session = SyncSession::new(config, &self.user, context, error_handler);
        inner.sessions.insert(path.clone(), Arc::clone(&session));
        info!(user = %self.user.identity(), path = %path, "session opened");
        Ok(session)
    }

    /// Returns the session for a server path.
    pub fn session_for_path(&self, server_path: &str) -> Option<Arc<SyncSession>> {
        self.inner.lock().sessions.get(server_path).cloned()
    }

    /// Returns every member session.
    pub fn sessions(&self) -> Vec<Arc<SyncSession>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Returns the connection a session binds over.
    pub fn connection_for(&self, session: &SyncSession) -> Arc<SyncConnection> {
        Arc::clone(session.connection())
    }

    /// Number of distinct connections in use.
    pub fn connection_count(&self) -> usize {
        let inner = self.inner.lock();
        if self.config.multiplex_sessions {
            inner.connections.len()
        } else {
            inner.sessions.len()
        }
    }

    /// Closes the session for `server_path` and drops it from the
    /// coordinator. Returns the removed session.
    pub fn remove_session(&self, server_path: &str) -> Option<Arc<SyncSession>> {
        let session = self.inner.lock().sessions.remove(server_path)?;
        debug!(path = server_path, "removing session");
        session.close();
        Some(session)
    }

    /// Force-closes every session and releases all connections. Further
    /// calls to [`SessionCoordinator::open_session`] fail.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.connections.clear();
            inner.sessions.drain().map(|(_, session)| session).collect()
        };
        info!(
            user = %self.user.identity(),
            sessions = sessions.len(),
            "shutting down session coordinator"
        );
        for session in sessions {
            session.force_close();
        }
    }

    /// Returns true once [`SessionCoordinator::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }
}

impl UserObserver for SessionCoordinator {
    fn user_logged_out(&self) {
        let sessions = self.sessions();
        debug!(user = %self.user.identity(), sessions = sessions.len(), "deactivating sessions after logout");
        for session in sessions {
            session.handle_user_logged_out();
        }
    }

    fn user_logged_in(&self) {
        for session in self.sessions() {
            session.handle_user_logged_in();
        }
    }

    fn access_token_refreshed(&self, token: &AccessToken) {
        for session in self.sessions() {
            session.handle_refreshed_token(token.clone());
        }
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SessionCoordinator")
            .field("user", &self.user.identity())
            .field("sessions", &inner.sessions.len())
            .field("connections", &inner.connections.len())
            .field("shut_down", &inner.shut_down)
            .finish()
    }
}
