//! # pulse-core
//!
//! Foundation types and utilities shared by the Pulse client and server.
//!
//! - **Branded IDs**: `EventId`, `ConnectionId`, `DeviceId` newtypes
//! - **Events**: [`event::Event`] and the closed [`event::EventType`] set
//! - **Wire envelope**: [`envelope::WireMessage`], the JSON object carried by
//!   every socket frame (including `batch` envelopes)
//! - **Errors**: `PulseError` hierarchy via `thiserror`
//! - **Backoff**: exponential reconnect delay with jitter
//! - **Heartbeat**: ping/pong liveness loop used on both ends of a socket
//! - **Logging**: `tracing` subscriber bootstrap, log and metric capture for tests

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod event;
pub mod heartbeat;
pub mod ids;
pub mod logging;
pub mod retry;

pub use envelope::{Timestamp, WireMessage};
pub use errors::{ParseError, PulseError, SessionError, TransportError, ValidationError};
pub use event::{Event, EventType};
pub use ids::{ConnectionId, DeviceId, EventId};

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
