//! Socket abstraction.
//!
//! The connection manager talks to a pair of channels instead of a concrete
//! WebSocket so tests can substitute an in-memory peer
//! ([`testing::MemoryConnector`](crate::testing::MemoryConnector)).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use pulse_core::TransportError;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// A unit on the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// One JSON text message.
    Text(String),
    /// The socket closed (inbound) or should close (outbound).
    Close,
}

/// An open socket as a channel pair.
///
/// Dropping `outgoing` closes the socket. `incoming` yields [`Frame::Close`]
/// (or ends) when the peer goes away.
#[derive(Debug)]
pub struct Socket {
    /// Frames to write.
    pub outgoing: mpsc::UnboundedSender<Frame>,
    /// Frames read from the peer.
    pub incoming: mpsc::UnboundedReceiver<Frame>,
}

/// Opens sockets. Each call is one connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`.
    async fn connect(&self, url: &str) -> Result<Socket, TransportError>;
}

/// WebSocket connector over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_owned(),
                message: e.to_string(),
            })?;
        debug!(url, "websocket open");

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        let _writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Close => break,
                };
                if let Err(e) = write.send(msg).await {
                    debug!(error = %e, "websocket write failed");
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        let _reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(Frame::Text(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
            let _ = in_tx.send(Frame::Close);
        });

        Ok(Socket {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
