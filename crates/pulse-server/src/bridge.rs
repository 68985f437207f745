//! Forwarding seam to the display layer.

use pulse_core::WireMessage;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::session::Session;

/// Receives routed messages and session transitions.
///
/// Called from socket tasks; implementations must not block.
pub trait Bridge: Send + Sync {
    /// A validated telemetry message attributed to `session_id`.
    fn forward(&self, session_id: &str, message: &WireMessage);

    /// A session was created, reattached, updated or disconnected.
    fn session_changed(&self, _session: &Session) {}
}

/// Drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBridge;

impl Bridge for NullBridge {
    fn forward(&self, _session_id: &str, _message: &WireMessage) {}
}

/// What a [`ChannelBridge`] emits.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgeEvent {
    /// A routed message.
    Message {
        /// Owning session.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// The message as received.
        message: WireMessage,
    },
    /// A session snapshot after a transition.
    Session {
        /// The snapshot.
        session: Session,
    },
}

/// Pushes every bridge call onto an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelBridge {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelBridge {
    /// Bridge plus the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Bridge for ChannelBridge {
    fn forward(&self, session_id: &str, message: &WireMessage) {
        let _ = self.tx.send(BridgeEvent::Message {
            session_id: session_id.to_owned(),
            message: message.clone(),
        });
    }

    fn session_changed(&self, session: &Session) {
        let _ = self.tx.send(BridgeEvent::Session {
            session: session.clone(),
        });
    }
}
