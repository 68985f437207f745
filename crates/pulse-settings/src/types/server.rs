//! Desktop-tool (server) settings.

use serde::{Deserialize, Serialize};

/// Transport server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Concurrent sockets accepted before answering 503.
    pub max_connections: usize,
    /// Seconds between WebSocket ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before the socket is closed.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted frame, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8347,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}
