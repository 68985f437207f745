//! In-memory connector for tests and embedders that do not want a real
//! socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pulse_core::{TransportError, WireMessage};
use tokio::sync::{Mutex, mpsc};

use crate::transport::{Connector, Frame, Socket};

/// Connector whose sockets terminate in a [`MemoryPeer`].
///
/// Counts attempts, can be told to fail the next N attempts, and can add a
/// fixed latency to each attempt.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

struct Inner {
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    latency: parking_lot::Mutex<Duration>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl MemoryConnector {
    /// New connector; every attempt succeeds immediately.
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                attempts: AtomicUsize::new(0),
                fail_next: AtomicUsize::new(0),
                latency: parking_lot::Mutex::new(Duration::ZERO),
                peers_tx,
                peers_rx: Mutex::new(peers_rx),
            }),
        }
    }

    /// Connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Make the next `n` attempts fail with [`TransportError::Connect`].
    pub fn fail_next(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every attempt by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Wait for the server end of the next successful attempt.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.inner.peers_rx.lock().await.recv().await
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let _ = self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect {
                url: url.to_owned(),
                message: "connection refused".into(),
            });
        }

        let (client_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, client_rx) = mpsc::unbounded_channel();
        let _ = self.inner.peers_tx.send(MemoryPeer {
            from_client: peer_rx,
            to_client: peer_tx,
        });
        Ok(Socket {
            outgoing: client_tx,
            incoming: client_rx,
        })
    }
}

/// The far end of an in-memory socket.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<Frame>,
}

impl MemoryPeer {
    /// Next frame the client wrote. `None` once the client dropped its end.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text message the client wrote, parsed. Skips close frames.
    pub async fn recv_message(&mut self) -> Option<WireMessage> {
        loop {
            match self.from_client.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Close => {}
            }
        }
    }

    /// A message the client wrote without waiting, if any.
    pub fn try_recv_message(&mut self) -> Option<WireMessage> {
        loop {
            match self.from_client.try_recv().ok()? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Close => {}
            }
        }
    }

    /// Deliver a message to the client.
    pub fn send(&self, message: &WireMessage) -> bool {
        message
            .to_json()
            .is_ok_and(|json| self.to_client.send(Frame::Text(json)).is_ok())
    }

    /// Deliver a raw text frame to the client.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Frame::Text(text.into())).is_ok()
    }

    /// Close from the server side.
    pub fn close(self) {
        let _ = self.to_client.send(Frame::Close);
    }
}
