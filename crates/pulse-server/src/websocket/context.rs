//! What a message handler sees.

use std::sync::Arc;

use crate::bridge::Bridge;
use crate::session::{Session, SessionManager};
use crate::websocket::connection::ClientConnection;

/// Per-socket handler context.
#[derive(Clone)]
pub struct SocketContext {
    /// The socket the message arrived on.
    pub connection: Arc<ClientConnection>,
    /// Shared session table.
    pub sessions: Arc<SessionManager>,
    /// Display-side forwarding.
    pub bridge: Arc<dyn Bridge>,
}

impl SocketContext {
    /// Session currently attached to this socket.
    pub fn session(&self) -> Option<Session> {
        self.sessions.session_for_socket(&self.connection.id)
    }

    /// Tell the bridge about a session transition.
    pub fn notify(&self, session: &Session) {
        self.bridge.session_changed(session);
    }
}
