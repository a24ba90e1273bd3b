//! Transport layer abstraction for sync connections.

use crate::connection::ServerEndpoint;
use crate::session::SessionId;
use crate::user::AccessToken;
use parking_lot::Mutex;

/// A sync transport carries commands from the session layer to the network.
///
/// Every method is a request: it must return promptly and must not call
/// back into the session layer on the calling thread. Results come back
/// later through [`crate::SyncConnection::handle_connection_state_change`],
/// [`crate::SyncSession::handle_progress_update`] and
/// [`crate::SyncSession::handle_error`].
pub trait SyncTransport: Send + Sync {
    /// Asks the transport to open a connection to the endpoint.
    fn request_connect(&self, endpoint: &ServerEndpoint);

    /// Asks the transport to close the connection to the endpoint.
    fn request_disconnect(&self, endpoint: &ServerEndpoint);

    /// Binds a session to the server file at `server_path`.
    fn bind_session(&self, session: SessionId, server_path: &str);

    /// Unbinds a session.
    fn unbind_session(&self, session: SessionId);

    /// Hands a fresh access token to a bound session.
    fn send_access_token(&self, session: SessionId, token: &AccessToken);
}

/// A command issued to a [`SyncTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// See [`SyncTransport::request_connect`].
    Connect(ServerEndpoint),
    /// See [`SyncTransport::request_disconnect`].
    Disconnect(ServerEndpoint),
    /// See [`SyncTransport::bind_session`].
    Bind {
        /// Bound session.
        session: SessionId,
        /// Server path.
        server_path: String,
    },
    /// See [`SyncTransport::unbind_session`].
    Unbind(SessionId),
    /// See [`SyncTransport::send_access_token`].
    AccessToken {
        /// Target session.
        session: SessionId,
        /// The token.
        token: AccessToken,
    },
}

/// A transport that records commands instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    commands: Mutex<Vec<TransportCommand>>,
}

impl RecordingTransport {
    /// Creates a new recording transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded command.
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.commands.lock().clone()
    }

    /// Removes and returns every recorded command.
    pub fn take_commands(&self) -> Vec<TransportCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Counts recorded commands matching a predicate.
    pub fn count(&self, predicate: impl Fn(&TransportCommand) -> bool) -> usize {
        self.commands.lock().iter().filter(|cmd| predicate(cmd)).count()
    }

    fn record(&self, command: TransportCommand) {
        self.commands.lock().push(command);
    }
}

impl SyncTransport for RecordingTransport {
    fn request_connect(&self, endpoint: &ServerEndpoint) {
        self.record(TransportCommand::Connect(endpoint.clone()));
    }

    fn request_disconnect(&self, endpoint: &ServerEndpoint) {
        self.record(TransportCommand::Disconnect(endpoint.clone()));
    }

    fn bind_session(&self, session: SessionId, server_path: &str) {
        self.record(TransportCommand::Bind {
            session,
            server_path: server_path.to_string(),
        });
    }

    fn unbind_session(&self, session: SessionId) {
        self.record(TransportCommand::Unbind(session));
    }

    fn send_access_token(&self, session: SessionId, token: &AccessToken) {
        self.record(TransportCommand::AccessToken {
            session,
            token: token.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SslConfig;

    #[test]
    fn records_in_order() {
        let transport = RecordingTransport::new();
        let endpoint = ServerEndpoint::new("wss://sync.example.com", SslConfig::default());
        let session = SessionId::new();

        transport.request_connect(&endpoint);
        transport.bind_session(session, "/notes");
        transport.send_access_token(session, &AccessToken::new("t0"));
        transport.unbind_session(session);

        let commands = transport.commands();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0], TransportCommand::Connect(endpoint));
        assert!(matches!(commands[1], TransportCommand::Bind { ref server_path, .. } if server_path == "/notes"));
        assert_eq!(commands[3], TransportCommand::Unbind(session));
    }

    #[test]
    fn take_clears() {
        let transport = RecordingTransport::new();
        transport.unbind_session(SessionId::new());
        assert_eq!(transport.take_commands().len(), 1);
        assert!(transport.commands().is_empty());
        assert_eq!(
            transport.count(|cmd| matches!(cmd, TransportCommand::Unbind(_))),
            0
        );
    }
}
