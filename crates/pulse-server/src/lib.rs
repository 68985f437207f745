//! # pulse-server
//!
//! The desktop end of the Pulse pipeline.
//!
//! - Axum HTTP + `WebSocket` server: `/` and `/ws` upgrade, `/health`, `/sessions`
//! - [`session::SessionManager`]: one session per device, reattached on reconnect
//! - Per-socket loop with ping-frame liveness and dispatch through
//!   `pulse_protocol::MessageRegistry`
//! - [`bridge::Bridge`]: the single forwarding seam to whatever displays events
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod bridge;
pub mod config;
pub mod handlers;
pub mod health;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod websocket;

pub use bridge::{Bridge, BridgeEvent, ChannelBridge, NullBridge};
pub use config::ServerConfig;
pub use server::PulseServer;
pub use session::{AppMetadata, Session, SessionManager, SessionStatus};
pub use shutdown::ShutdownCoordinator;
pub use websocket::context::SocketContext;
