//! `/health` endpoint body.

use serde::Serialize;
use tokio::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open sockets, including ones still awaiting a handshake.
    pub connections: usize,
    /// Known device sessions.
    pub sessions: usize,
    /// Sessions with a socket attached.
    pub connected_sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    connections: usize,
    sessions: usize,
    connected_sessions: usize,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        sessions,
        connected_sessions,
    }
}
