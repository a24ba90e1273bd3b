//! Shared server connections.
//!
//! A [`SyncConnection`] tracks the connectivity of one transport link and the
//! sessions bound over it. Sessions never hold their own lock while calling
//! into a connection, and a connection never holds its lock while calling
//! into a session.

use crate::config::{SessionConfig, SslConfig};
use crate::session::{SessionId, SyncSession};
use crate::transport::SyncTransport;
use crate::user::AccessToken;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tidesync_protocol::SessionErrorInfo;
use tracing::{debug, info};

/// Connectivity of a transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and none requested.
    #[default]
    Disconnected,
    /// A connection has been requested.
    Connecting,
    /// The link is up.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// The server a connection talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    /// Server URL.
    pub url: String,
    /// TLS settings.
    pub ssl: SslConfig,
}

impl ServerEndpoint {
    /// Creates an endpoint.
    pub fn new(url: impl Into<String>, ssl: SslConfig) -> Self {
        Self {
            url: url.into(),
            ssl,
        }
    }

    /// Returns the endpoint a session configuration points at.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.server_url.clone(), config.ssl.clone())
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

struct AttachedSession {
    id: SessionId,
    session: Weak<SyncSession>,
}

#[derive(Default)]
struct ConnectionInner {
    state: ConnectionState,
    sessions: Vec<AttachedSession>,
    // Newest attach/detach epoch seen per session. Older requests are
    // stale and dropped.
    epochs: HashMap<SessionId, u64>,
}

impl ConnectionInner {
    fn is_stale(&mut self, id: SessionId, epoch: u64) -> bool {
        let seen = self.epochs.entry(id).or_insert(epoch);
        if epoch < *seen {
            return true;
        }
        *seen = epoch;
        false
    }

    fn snapshot(&self) -> Vec<Arc<SyncSession>> {
        self.sessions
            .iter()
            .filter_map(|attached| attached.session.upgrade())
            .collect()
    }
}

/// A transport link shared by one or more sessions.
pub struct SyncConnection {
    endpoint: ServerEndpoint,
    transport: Arc<dyn SyncTransport>,
    inner: Mutex<ConnectionInner>,
}

impl SyncConnection {
    /// Creates a disconnected connection.
    pub fn new(endpoint: ServerEndpoint, transport: Arc<dyn SyncTransport>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            transport,
            inner: Mutex::new(ConnectionInner::default()),
        })
    }

    /// Returns the endpoint.
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Returns the connectivity state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Number of attached sessions.
    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Returns true if the session is attached.
    pub fn is_attached(&self, id: SessionId) -> bool {
        self.inner
            .lock()
            .sessions
            .iter()
            .any(|attached| attached.id == id)
    }

    /// Applies a connectivity change reported by the transport and
    /// broadcasts it, together with an optional error, to every attached
    /// session.
    pub fn handle_connection_state_change(
        &self,
        new_state: ConnectionState,
        error: Option<SessionErrorInfo>,
    ) {
        let (old_state, sessions) = {
            let mut inner = self.inner.lock();
            let old_state = inner.state;
            if old_state == new_state && error.is_none() {
                return;
            }
            inner.state = new_state;
            (old_state, inner.snapshot())
        };

        if old_state != new_state {
            info!(
                endpoint = %self.endpoint,
                from = %old_state,
                to = %new_state,
                sessions = sessions.len(),
                "connection state changed"
            );
            for session in &sessions {
                session.handle_connection_state_change(old_state, new_state);
            }
        }
        if let Some(error) = error {
            for session in &sessions {
                session.handle_error(error.clone());
            }
        }
    }

    /// Binds a session and hands it its token, connecting first if needed.
    ///
    /// Returns the connection state the session now observes, or `None` if
    /// the request was stale.
    pub(crate) fn attach(
        &self,
        session: &Arc<SyncSession>,
        server_path: &str,
        token: &AccessToken,
        epoch: u64,
    ) -> Option<ConnectionState> {
        let id = session.session_id();
        let (transition, others) = {
            let mut inner = self.inner.lock();
            if inner.is_stale(id, epoch) {
                debug!(session_id = %id, epoch, "ignoring stale attach");
                return None;
            }

            if inner.sessions.iter().any(|attached| attached.id == id) {
                self.transport.send_access_token(id, token);
                return Some(inner.state);
            }

            let transition = if inner.state == ConnectionState::Disconnected {
                inner.state = ConnectionState::Connecting;
                self.transport.request_connect(&self.endpoint);
                Some((ConnectionState::Disconnected, ConnectionState::Connecting))
            } else {
                None
            };
            let others = if transition.is_some() {
                inner.snapshot()
            } else {
                Vec::new()
            };

            inner.sessions.push(AttachedSession {
                id,
                session: Arc::downgrade(session),
            });
            self.transport.bind_session(id, server_path);
            self.transport.send_access_token(id, token);
            debug!(
                session_id = %id,
                endpoint = %self.endpoint,
                path = server_path,
                "session attached"
            );
            (transition, others)
        };

        if let Some((old_state, new_state)) = transition {
            for other in others {
                other.handle_connection_state_change(old_state, new_state);
            }
        }
        Some(self.state())
    }

    /// Unbinds a session; disconnects when it was the last one.
    pub(crate) fn detach(&self, id: SessionId, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.is_stale(id, epoch) {
            debug!(session_id = %id, epoch, "ignoring stale detach");
            return;
        }
        self.unbind_locked(&mut inner, id);
    }

    /// Unbinds a session that is being destroyed and forgets it.
    pub(crate) fn release(&self, id: SessionId) {
        let mut inner = self.inner.lock();
        inner.epochs.remove(&id);
        self.unbind_locked(&mut inner, id);
    }

    #[cfg(test)]
    pub(crate) fn tracked_epochs(&self) -> usize {
        self.inner.lock().epochs.len()
    }

    /// Forwards a refreshed token to an attached session.
    pub(crate) fn send_access_token(&self, id: SessionId, token: &AccessToken) {
        let inner = self.inner.lock();
        if inner.sessions.iter().any(|attached| attached.id == id) {
            self.transport.send_access_token(id, token);
        }
    }

    fn unbind_locked(&self, inner: &mut ConnectionInner, id: SessionId) {
        let before = inner.sessions.len();
        inner.sessions.retain(|attached| attached.id != id);
        if inner.sessions.len() == before {
            return;
        }
        self.transport.unbind_session(id);
        debug!(session_id = %id, endpoint = %self.endpoint, "session detached");

        if inner.sessions.is_empty() && inner.state != ConnectionState::Disconnected {
            self.transport.request_disconnect(&self.endpoint);
            inner.state = ConnectionState::Disconnected;
            debug!(endpoint = %self.endpoint, "last session detached, disconnecting");
        }
    }
}

impl fmt::Debug for SyncConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SyncConnection")
            .field("endpoint", &self.endpoint)
            .field("state", &inner.state)
            .field("sessions", &inner.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_config() {
        let config = SessionConfig::new("wss://sync.example.com", "/a");
        let endpoint = ServerEndpoint::from_config(&config);
        assert_eq!(endpoint.url, "wss://sync.example.com");
        assert!(endpoint.ssl.enabled);
        assert_eq!(
            endpoint,
            ServerEndpoint::from_config(&SessionConfig::new("wss://sync.example.com", "/b"))
        );
    }

    #[test]
    fn stale_epochs_are_detected() {
        let mut inner = ConnectionInner::default();
        let id = SessionId::new();
        assert!(!inner.is_stale(id, 3));
        assert!(!inner.is_stale(id, 3));
        assert!(inner.is_stale(id, 2));
        assert!(!inner.is_stale(id, 7));
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
