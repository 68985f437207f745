//! Server configuration.

use std::time::Duration;

use pulse_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`PulseServer`](crate::PulseServer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Sockets accepted concurrently; further upgrades get HTTP 503.
    pub max_connections: usize,
    /// Seconds between ping frames.
    pub heartbeat_interval_secs: u64,
    /// Close a socket after this many seconds without inbound activity.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Ping frame interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence allowed before a socket is dropped.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            heartbeat_interval_secs: s.heartbeat_interval_secs,
            heartbeat_timeout_secs: s.heartbeat_timeout_secs,
            max_message_size: s.max_message_size,
        }
    }
}
