//! Client connection manager.
//!
//! ```text
//! disconnected --connect()--> connecting --open--> connected
//!      ^                          |                  |
//!      |                       failure             close / error / pong timeout
//!      |                          v                  v
//!      +--- backoff timer ---- error / disconnected <+
//! ```
//!
//! Only one attempt is ever in flight: `connect()` flips the state to
//! `connecting` under the state lock before anything is spawned, and is a
//! no-op while `connecting` or `connected`.
//!
//! Every attempt runs under its own [`CancellationToken`]. `disconnect()`
//! and `stop()` cancel it, which stops the attempt, the reader, the
//! heartbeat and any scheduled reconnect in one step.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use pulse_core::heartbeat::{HeartbeatResult, Liveness, run_heartbeat};
use pulse_core::{DeviceId, EventType, PulseError, SessionError, TransportError, WireMessage};
use pulse_protocol::MessageRegistry;
use pulse_settings::{ClientSettings, HealthCheckSettings, ReconnectSettings};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::outbox::PendingQueue;
use crate::queue::EventSink;
use crate::transport::{Connector, Frame, Socket};

/// Client connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No socket and no attempt in flight.
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// Socket open, handshake sent.
    Connected,
    /// The last attempt or socket failed; see [`ConnectionStatus::last_error`].
    Error,
}

/// Snapshot for a UI layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Most recent error, cleared on a successful open.
    pub last_error: Option<String>,
    /// Consecutive failed attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Messages waiting in the pending queue.
    pub pending: usize,
    /// Session assigned by the server's handshake acknowledgement.
    pub session_id: Option<String>,
}

/// Everything the manager needs to dial and identify itself.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// `ws://host:port`
    pub url: String,
    /// Stable device identity sent in the handshake.
    pub device_id: DeviceId,
    /// Platform sent in the handshake.
    pub platform: String,
    /// Extra handshake fields (monitoring flags, app name).
    pub handshake_extra: Value,
    /// Reconnect policy.
    pub reconnect: ReconnectSettings,
    /// Ping/pong policy.
    pub health_check: HealthCheckSettings,
    /// PendingQueue capacity.
    pub max_pending_messages: usize,
    /// Limit for a single attempt.
    pub connect_timeout: Duration,
}

impl From<&ClientSettings> for ConnectionConfig {
    fn from(s: &ClientSettings) -> Self {
        let device_id = s
            .device_id
            .clone()
            .map_or_else(DeviceId::new, DeviceId::from);
        let mut extra = json!({ "monitoring": s.monitoring });
        if let (Some(name), Some(obj)) = (&s.app_name, extra.as_object_mut()) {
            let _ = obj.insert("appName".into(), Value::String(name.clone()));
        }
        Self {
            url: s.url(),
            device_id,
            platform: s.platform.clone(),
            handshake_extra: extra,
            reconnect: s.reconnect.clone(),
            health_check: s.health_check.clone(),
            max_pending_messages: s.max_pending_messages,
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
        }
    }
}

/// Owns the socket, the handshake, reconnection and the send path.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    registry: MessageRegistry<ConnectionManager>,
    status: Mutex<StatusCell>,
    send: Mutex<SendState>,
    /// Set by `disconnect()`/`stop()` and by a rejected handshake.
    no_reconnect: AtomicBool,
    stopped: AtomicBool,
    attempts: AtomicU32,
    generation: Mutex<CancellationToken>,
    status_tx: watch::Sender<ConnectionStatus>,
}

struct StatusCell {
    state: ConnectionState,
    last_error: Option<String>,
    session_id: Option<String>,
}

/// The writer and the pending queue share one lock so "flush queued, then
/// accept new sends" is atomic with respect to `send`.
struct SendState {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    pending: PendingQueue,
}

impl ConnectionManager {
    /// Manager with only the built-in incoming handlers.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_registry(config, connector, MessageRegistry::new())
    }

    /// Manager dispatching incoming messages through `registry`.
    ///
    /// Handlers for `ping`, `pong` and `handshake_acknowledge` are installed
    /// over whatever the registry had for those types.
    pub fn with_registry(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        mut registry: MessageRegistry<ConnectionManager>,
    ) -> Self {
        registry.on(EventType::Ping, |_msg, conn: &ConnectionManager| {
            let _ = conn.send_message(&WireMessage::pong());
            Ok(())
        });
        registry.on(EventType::Pong, |_msg, _conn: &ConnectionManager| Ok(()));
        registry.on(EventType::HandshakeAck, on_handshake_ack);

        let initial = ConnectionStatus {
            state: ConnectionState::Disconnected,
            last_error: None,
            reconnect_attempts: 0,
            pending: 0,
            session_id: None,
        };
        let (status_tx, _) = watch::channel(initial);
        let pending = PendingQueue::new(config.max_pending_messages);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry,
                status: Mutex::new(StatusCell {
                    state: ConnectionState::Disconnected,
                    last_error: None,
                    session_id: None,
                }),
                send: Mutex::new(SendState { tx: None, pending }),
                no_reconnect: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                generation: Mutex::new(CancellationToken::new()),
                status_tx,
            }),
        }
    }

    /// Start connecting. Returns `false` (and does nothing) when already
    /// connecting or connected.
    ///
    /// Re-enables auto-reconnect after `disconnect()`/`stop()`.
    pub fn connect(&self) -> bool {
        self.inner.no_reconnect.store(false, Ordering::SeqCst);
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.start_attempt()
    }

    fn start_attempt(&self) -> bool {
        let token = {
            let mut status = self.inner.status.lock();
            if matches!(
                status.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!(state = ?status.state, "connect ignored");
                return false;
            }
            status.state = ConnectionState::Connecting;
            let token = CancellationToken::new();
            let previous = std::mem::replace(&mut *self.inner.generation.lock(), token.clone());
            previous.cancel();
            token
        };
        self.publish_status();

        let this = self.clone();
        let _ = tokio::spawn(async move { this.run_attempt(token).await });
        true
    }

    /// Close the socket and cancel timers. Buffered messages stay queued and
    /// go out on the next `connect()`. No auto-reconnect until then.
    pub fn disconnect(&self) {
        self.inner.no_reconnect.store(true, Ordering::SeqCst);
        {
            let mut status = self.inner.status.lock();
            self.inner.generation.lock().cancel();
            status.state = ConnectionState::Disconnected;
        }
        {
            let mut send = self.inner.send.lock();
            if let Some(tx) = send.tx.take() {
                let _ = tx.send(Frame::Close);
            }
        }
        info!(url = %self.inner.config.url, "disconnected");
        self.publish_status();
    }

    /// Full shutdown: disconnect, discard the pending queue, and refuse
    /// sends until the next `connect()`.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.disconnect();
        self.inner.send.lock().pending.clear();
        self.publish_status();
    }

    /// Send a message now, or queue it if the socket is not open.
    ///
    /// Returns `true` when handed to the socket, `false` when deferred (or
    /// dropped after `stop()`). Never panics or errors.
    pub fn send_message(&self, message: &WireMessage) -> bool {
        if self.inner.stopped.load(Ordering::SeqCst) {
            debug!(message_type = %message.message_type, "client stopped, dropping message");
            return false;
        }
        let message = match self.session_id() {
            Some(sid) if message.session_id.is_none() => message.clone().with_session_id(sid),
            _ => message.clone(),
        };
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize outgoing message");
                return false;
            }
        };

        let mut send = self.inner.send.lock();
        let json = match send.tx.as_ref() {
            Some(tx) => match tx.send(Frame::Text(json)) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(Frame::Text(json))) => {
                    send.tx = None;
                    json
                }
                Err(_) => return false,
            },
            None => json,
        };
        send.pending.push(json);
        false
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        let status = self.inner.status.lock();
        ConnectionStatus {
            state: status.state,
            last_error: status.last_error.clone(),
            reconnect_attempts: self.inner.attempts.load(Ordering::SeqCst),
            pending: self.inner.send.lock().pending.len(),
            session_id: status.session_id.clone(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.lock().state
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Session ID from the last accepting handshake acknowledgement.
    pub fn session_id(&self) -> Option<String> {
        self.inner.status.lock().session_id.clone()
    }

    /// Device identity used in the handshake.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.config.device_id
    }

    /// Observe status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    fn publish_status(&self) {
        let snapshot = self.status();
        let _ = self.inner.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    async fn run_attempt(self, token: CancellationToken) {
        let config = &self.inner.config;
        let attempt = self.inner.attempts.load(Ordering::SeqCst);
        debug!(url = %config.url, attempt, "connecting");

        let connect = tokio::time::timeout(
            config.connect_timeout,
            self.inner.connector.connect(&config.url),
        );
        let result = tokio::select! {
            () = token.cancelled() => return,
            result = connect => result,
        };

        match result {
            Ok(Ok(socket)) => self.run_socket(socket, &token).await,
            Ok(Err(e)) => self.on_closed(&token, Some(e)),
            Err(_) => {
                let timeout_ms = u64::try_from(config.connect_timeout.as_millis()).unwrap_or(u64::MAX);
                self.on_closed(
                    &token,
                    Some(TransportError::Timeout {
                        url: config.url.clone(),
                        timeout_ms,
                    }),
                );
            }
        }
    }

    async fn run_socket(&self, socket: Socket, token: &CancellationToken) {
        let Socket {
            outgoing,
            mut incoming,
        } = socket;

        if !self.on_open(&outgoing, token) {
            let _ = outgoing.send(Frame::Close);
            return;
        }

        let health = &self.inner.config.health_check;
        let liveness = Liveness::new();
        let ping_tx = outgoing.clone();
        let heartbeat = run_heartbeat(
            &liveness,
            Duration::from_millis(health.interval_ms),
            Duration::from_millis(health.timeout_ms),
            token.child_token(),
            || {
                WireMessage::ping()
                    .to_json()
                    .is_ok_and(|json| ping_tx.send(Frame::Text(json)).is_ok())
            },
        );
        tokio::pin!(heartbeat);

        let error = loop {
            tokio::select! {
                () = token.cancelled() => {
                    let _ = outgoing.send(Frame::Close);
                    return;
                }
                frame = incoming.recv() => match frame {
                    Some(Frame::Text(text)) => {
                        liveness.mark_alive();
                        let _ = self.inner.registry.handle(&text, self).await;
                    }
                    Some(Frame::Close) | None => break None,
                },
                result = &mut heartbeat, if health.enabled => match result {
                    HeartbeatResult::TimedOut => {
                        warn!(timeout_ms = health.timeout_ms, "no pong, closing socket");
                        let _ = outgoing.send(Frame::Close);
                        break Some(TransportError::Unresponsive { timeout_ms: health.timeout_ms });
                    }
                    HeartbeatResult::SendFailed => break Some(TransportError::Closed),
                    HeartbeatResult::Cancelled => return,
                },
            }
        };

        self.on_closed(token, error);
    }

    /// Install the writer, send the handshake, then flush the pending queue
    /// in FIFO order. Returns `false` if the attempt was cancelled meanwhile.
    fn on_open(&self, outgoing: &mpsc::UnboundedSender<Frame>, token: &CancellationToken) -> bool {
        let config = &self.inner.config;
        let mut status = self.inner.status.lock();
        if token.is_cancelled() {
            return false;
        }

        let handshake = WireMessage::handshake(
            config.device_id.as_str(),
            &config.platform,
            config.handshake_extra.clone(),
        );
        let flushed = {
            let mut send = self.inner.send.lock();
            if let Ok(json) = handshake.to_json() {
                let _ = outgoing.send(Frame::Text(json));
            }
            let queued = send.pending.drain();
            let count = queued.len();
            for json in queued {
                let _ = outgoing.send(Frame::Text(json));
            }
            send.tx = Some(outgoing.clone());
            count
        };

        status.state = ConnectionState::Connected;
        status.last_error = None;
        drop(status);
        self.inner.attempts.store(0, Ordering::SeqCst);
        info!(url = %config.url, device_id = %config.device_id, flushed, "connected");
        self.publish_status();
        true
    }

    /// Socket closed or attempt failed. Schedules exactly one reconnect
    /// unless reconnection is disabled or the attempt was cancelled.
    fn on_closed(&self, token: &CancellationToken, error: Option<TransportError>) {
        {
            let mut status = self.inner.status.lock();
            if token.is_cancelled() {
                return;
            }
            self.inner.send.lock().tx = None;
            match &error {
                Some(e) => {
                    warn!(url = %self.inner.config.url, error = %e, "connection failed");
                    status.state = ConnectionState::Error;
                    status.last_error = Some(e.to_string());
                }
                None => {
                    info!(url = %self.inner.config.url, "socket closed");
                    status.state = ConnectionState::Disconnected;
                }
            }
        }
        self.publish_status();

        if self.inner.no_reconnect.load(Ordering::SeqCst) || !self.inner.config.reconnect.enabled {
            return;
        }
        self.schedule_reconnect(token.clone());
    }

    fn schedule_reconnect(&self, token: CancellationToken) {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .inner
            .config
            .reconnect
            .backoff
            .delay(attempt, rand::random::<f64>());
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(attempt = attempt + 1, delay_ms, "scheduling reconnect");
        counter!("client_reconnects_total").increment(1);
        self.publish_status();

        let this = self.clone();
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !this.inner.no_reconnect.load(Ordering::SeqCst) {
                        let _ = this.start_attempt();
                    }
                }
            }
        });
    }

    /// The server refused us: close the socket, stay in `Error`, and wait
    /// for an explicit `connect()`.
    fn record_rejection(&self, reason: &str) {
        self.inner.no_reconnect.store(true, Ordering::SeqCst);
        {
            let mut status = self.inner.status.lock();
            self.inner.generation.lock().cancel();
            status.state = ConnectionState::Error;
            status.last_error = Some(SessionError::Rejected(reason.to_owned()).to_string());
            status.session_id = None;
        }
        if let Some(tx) = self.inner.send.lock().tx.take() {
            let _ = tx.send(Frame::Close);
        }
        self.publish_status();
    }

    fn record_session(&self, session_id: String) {
        self.inner.status.lock().session_id = Some(session_id);
        self.publish_status();
    }
}

impl EventSink for ConnectionManager {
    fn send_message(&self, message: &WireMessage) -> bool {
        ConnectionManager::send_message(self, message)
    }
}

fn on_handshake_ack(msg: WireMessage, conn: &ConnectionManager) -> Result<(), PulseError> {
    let payload = &msg.payload;
    if payload.get("status").and_then(Value::as_str) == Some("connected") {
        let session_id = payload
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or(msg.session_id);
        if let Some(sid) = session_id {
            info!(session_id = %sid, "handshake accepted");
            conn.record_session(sid);
        }
        return Ok(());
    }

    let reason = payload
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("no reason given");
    warn!(reason, "handshake rejected");
    conn.record_rejection(reason);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnector, MemoryPeer};
    use pulse_core::{Event, retry::BackoffPolicy};

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://127.0.0.1:8347".into(),
            device_id: DeviceId::from("dev-1"),
            platform: "ios".into(),
            handshake_extra: json!({"monitoring": {"console": true}}),
            reconnect: ReconnectSettings {
                enabled: true,
                backoff: BackoffPolicy::fixed(1000),
            },
            health_check: HealthCheckSettings {
                enabled: false,
                ..HealthCheckSettings::default()
            },
            max_pending_messages: 100,
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn manager(config: ConnectionConfig) -> (ConnectionManager, MemoryConnector) {
        let connector = MemoryConnector::new();
        (
            ConnectionManager::new(config, Arc::new(connector.clone())),
            connector,
        )
    }

    fn console(msg: &str) -> WireMessage {
        WireMessage::from_event(&Event::new(
            EventType::ConsoleLog,
            json!({"level": "log", "message": msg}),
        ))
    }

    async fn open(conn: &ConnectionManager, connector: &MemoryConnector) -> MemoryPeer {
        assert!(conn.connect());
        let mut peer = connector.accept().await.unwrap();
        let handshake = peer.recv_message().await.unwrap();
        assert_eq!(handshake.kind(), Some(EventType::Handshake));
        peer
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn handshake_carries_identity() {
        let (conn, connector) = manager(config());
        assert!(conn.connect());
        let mut peer = connector.accept().await.unwrap();
        let hs = peer.recv_message().await.unwrap();
        assert_eq!(hs.payload["deviceId"], "dev-1");
        assert_eq!(hs.payload["platform"], "ios");
        assert_eq!(hs.payload["monitoring"]["console"], true);
        settle().await;
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_while_connecting_opens_nothing() {
        let (conn, connector) = manager(config());
        connector.set_latency(Duration::from_millis(500));

        assert!(conn.connect());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.connect());
        assert!(!conn.connect());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(conn.is_connected());
        assert!(!conn.connect());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_deferred() {
        let (conn, _connector) = manager(config());
        assert!(!conn.send_message(&console("queued")));
        assert_eq!(conn.status().pending, 1);
    }

    #[tokio::test]
    async fn queued_messages_flush_in_order_before_new_ones() {
        let (conn, connector) = manager(config());
        for i in 0..3 {
            let _ = conn.send_message(&console(&format!("q{i}")));
        }

        let mut peer = open(&conn, &connector).await;
        settle().await;
        assert!(conn.send_message(&console("fresh")));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let msg = peer.recv_message().await.unwrap();
            seen.push(msg.payload["message"].as_str().unwrap().to_owned());
        }
        assert_eq!(seen, vec!["q0", "q1", "q2", "fresh"]);
        assert_eq!(conn.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_then_reconnect_preserves_fifo() {
        let (conn, connector) = manager(config());
        let peer = open(&conn, &connector).await;
        settle().await;

        conn.disconnect();
        drop(peer);
        let _ = conn.send_message(&console("a"));
        let _ = conn.send_message(&console("b"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts(), 1, "manual disconnect must not reconnect");

        let mut peer = open(&conn, &connector).await;
        settle().await;
        let _ = conn.send_message(&console("c"));
        let got: Vec<_> = [
            peer.recv_message().await.unwrap(),
            peer.recv_message().await.unwrap(),
            peer.recv_message().await.unwrap(),
        ]
        .iter()
        .map(|m| m.payload["message"].as_str().unwrap().to_owned())
        .collect();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_schedules_one_reconnect() {
        let (conn, connector) = manager(config());
        let peer = open(&conn, &connector).await;
        settle().await;

        peer.close();
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.status().reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(connector.attempts(), 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let _peer = connector.accept().await.unwrap();
        assert_eq!(connector.attempts(), 2);
        settle().await;
        assert!(conn.is_connected());
        assert_eq!(conn.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_exponentially() {
        let mut cfg = config();
        cfg.reconnect.backoff = BackoffPolicy {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter_factor: 0.0,
        };
        let (conn, connector) = manager(cfg);
        connector.fail_next(3);

        assert!(conn.connect());
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.status().last_error.unwrap().contains("refused"));

        // Retries at +100ms, +200ms, +400ms.
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(connector.attempts(), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.attempts(), 3);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.attempts(), 4);
        let _peer = connector.accept().await.unwrap();
        settle().await;
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let (conn, connector) = manager(config());
        connector.fail_next(1);
        assert!(conn.connect());
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Error);

        conn.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_disabled_stays_down() {
        let mut cfg = config();
        cfg.reconnect.enabled = false;
        let (conn, connector) = manager(cfg);
        let peer = open(&conn, &connector).await;
        settle().await;
        peer.close();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_an_error() {
        let mut cfg = config();
        cfg.connect_timeout = Duration::from_millis(200);
        cfg.reconnect.enabled = false;
        let (conn, connector) = manager(cfg);
        connector.set_latency(Duration::from_secs(5));

        assert!(conn.connect());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.status().last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn stop_discards_queue_and_refuses_sends() {
        let (conn, _connector) = manager(config());
        let _ = conn.send_message(&console("a"));
        conn.stop();
        assert_eq!(conn.status().pending, 0);
        assert!(!conn.send_message(&console("b")));
        assert_eq!(conn.status().pending, 0);
    }

    #[tokio::test]
    async fn ack_stores_session_id_and_stamps_messages() {
        let (conn, connector) = manager(config());
        let mut peer = open(&conn, &connector).await;
        assert!(peer.send(&WireMessage::handshake_ack_connected("sess-9")));
        settle().await;
        assert_eq!(conn.session_id().as_deref(), Some("sess-9"));

        let _ = conn.send_message(&console("x"));
        let msg = peer.recv_message().await.unwrap();
        assert_eq!(msg.session_id.as_deref(), Some("sess-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_handshake_disables_reconnect() {
        let (conn, connector) = manager(config());
        let mut peer = open(&conn, &connector).await;
        assert!(peer.send(&WireMessage::handshake_ack_rejected("bad device")));
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.status().last_error.unwrap().contains("bad device"));

        assert_eq!(peer.recv().await, Some(Frame::Close));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn server_ping_is_answered() {
        let (conn, connector) = manager(config());
        let mut peer = open(&conn, &connector).await;
        assert!(peer.send(&WireMessage::ping()));
        let reply = peer.recv_message().await.unwrap();
        assert_eq!(reply.kind(), Some(EventType::Pong));
        drop(conn);
    }

    #[tokio::test]
    async fn garbage_from_server_keeps_socket_open() {
        let (conn, connector) = manager(config());
        let mut peer = open(&conn, &connector).await;
        assert!(peer.send_raw("not json"));
        assert!(peer.send_raw(r#"{"type":"mystery","timestamp":1}"#));
        assert!(peer.send(&WireMessage::ping()));
        assert_eq!(peer.recv_message().await.unwrap().kind(), Some(EventType::Pong));
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_pings_force_reconnect() {
        let mut cfg = config();
        cfg.health_check = HealthCheckSettings {
            enabled: true,
            interval_ms: 1000,
            timeout_ms: 500,
        };
        let (conn, connector) = manager(cfg);
        let mut peer = open(&conn, &connector).await;

        tokio::time::sleep(Duration::from_millis(1001)).await;
        let ping = peer.recv_message().await.unwrap();
        assert_eq!(ping.kind(), Some(EventType::Ping));

        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.status().last_error.unwrap().contains("pong"));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ping_interval_still_notices_server_close() {
        let mut cfg = config();
        cfg.health_check = HealthCheckSettings {
            enabled: true,
            interval_ms: 0,
            timeout_ms: 60_000,
        };
        let (conn, connector) = manager(cfg);
        let peer = open(&conn, &connector).await;
        settle().await;
        assert!(conn.is_connected());

        peer.close();
        settle().await;
        assert_ne!(conn.state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn status_watch_sees_transitions() {
        let (conn, connector) = manager(config());
        let mut rx = conn.subscribe_status();
        let _peer = open(&conn, &connector).await;
        let connected = rx
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        assert!(connected.last_error.is_none());
    }

    #[test]
    fn config_from_settings() {
        let settings = ClientSettings {
            device_id: Some("sim".into()),
            app_name: Some("Demo".into()),
            ..ClientSettings::default()
        };
        let cfg = ConnectionConfig::from(&settings);
        assert_eq!(cfg.url, "ws://127.0.0.1:8347");
        assert_eq!(cfg.device_id.as_str(), "sim");
        assert_eq!(cfg.handshake_extra["appName"], "Demo");
        assert_eq!(cfg.handshake_extra["monitoring"]["redux"], true);
    }

    #[test]
    fn missing_device_id_is_generated() {
        let a = ConnectionConfig::from(&ClientSettings::default());
        let b = ConnectionConfig::from(&ClientSettings::default());
        assert_ne!(a.device_id, b.device_id);
    }
}
