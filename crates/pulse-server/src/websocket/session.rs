//! Socket lifecycle: from upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use pulse_core::ConnectionId;
use pulse_protocol::MessageRegistry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, OUTBOUND_CAPACITY};
use super::context::SocketContext;
use crate::bridge::Bridge;
use crate::session::SessionManager;

/// Liveness timing for server sockets.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// Ping frame period.
    pub interval: Duration,
    /// Silence after which the socket is dropped.
    pub timeout: Duration,
}

/// Shared pieces every socket loop needs.
#[derive(Clone)]
pub struct SessionDeps {
    /// Dispatch table.
    pub registry: Arc<MessageRegistry<SocketContext>>,
    /// Session table.
    pub sessions: Arc<SessionManager>,
    /// Display-side forwarding.
    pub bridge: Arc<dyn Bridge>,
    /// Ping timing.
    pub heartbeat: Heartbeat,
    /// Server-wide shutdown.
    pub shutdown: CancellationToken,
}

/// Run one client socket until it closes, goes silent, or the server
/// shuts down.
///
/// Text (and UTF-8 binary) frames go through the registry; the socket is
/// awaiting its handshake until the `handshake` handler attaches it to a
/// session. Whatever the reason for leaving, the session manager is told
/// the socket is gone.
#[instrument(skip_all, fields(connection_id))]
pub async fn run_ws_session(ws: WebSocket, deps: SessionDeps) {
    let connection_id = ConnectionId::new();
    let _ = tracing::Span::current().record("connection_id", connection_id.as_str());

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let connection = Arc::new(ClientConnection::new(connection_id, send_tx));
    let ctx = SocketContext {
        connection: connection.clone(),
        sessions: deps.sessions.clone(),
        bridge: deps.bridge.clone(),
    };
    info!("client connected, awaiting handshake");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let heartbeat = deps.heartbeat;
    let shutdown = deps.shutdown.clone();
    let outbound_conn = connection.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_seen_elapsed() > heartbeat.timeout
                    {
                        warn!(timeout_secs = heartbeat.timeout.as_secs(), "client unresponsive, closing");
                        counter!("ws_heartbeat_timeouts_total").increment(1);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = &mut outbound => break,
            frame = ws_rx.next() => frame,
        };
        let Some(Ok(msg)) = frame else { break };

        connection.mark_alive();
        let text = match msg {
            Message::Text(ref t) => Some(t.as_str()),
            Message::Binary(ref data) => {
                let text = std::str::from_utf8(data).ok();
                if text.is_none() {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                }
                text
            }
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => None,
        };

        if let Some(text) = text {
            let _ = deps.registry.handle(text, &ctx).await;
        }
    }

    outbound.abort();
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection.age().as_secs_f64());
    if let Some(session) = deps.sessions.handle_disconnect(&connection.id) {
        deps.bridge.session_changed(&session);
    }
    info!(
        age_secs = connection.age().as_secs(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
}
