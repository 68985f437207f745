//! Server-side state for one accepted socket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use pulse_core::{ConnectionId, WireMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// Frames buffered for the writer task before sends start failing.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// One accepted socket. Device identity lives in the session manager's
/// side table, not here.
pub struct ClientConnection {
    /// Transient socket ID.
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected_at: Instant,
    alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped: AtomicU64,
}

impl ClientConnection {
    /// New connection writing into `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a text frame. `false` if the writer is gone or backed up.
    pub fn send(&self, text: String) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("ws_outbound_dropped_total").increment(1);
            false
        }
    }

    /// Serialize and queue an envelope.
    pub fn send_message(&self, message: &WireMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send(json),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "failed to serialize outbound message");
                false
            }
        }
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record inbound activity of any kind.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Read and clear the activity flag. `true` if anything arrived since
    /// the previous call.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound activity.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Time since the socket was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
