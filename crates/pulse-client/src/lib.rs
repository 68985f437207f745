//! # pulse-client
//!
//! The instrumented-app side of Pulse.
//!
//! ```text
//! emit(event) -> DuplicateSuppressor -> BatchQueue -> ConnectionManager -> socket
//!                                                         |
//!                                                    PendingQueue (while offline)
//! ```
//!
//! [`PulseClient`] owns one of each and is the only type most callers need.
//! There is no global instance; construct one per upstream.

#![deny(unsafe_code)]

pub mod client;
pub mod connection;
pub mod dedup;
pub mod outbox;
pub mod queue;
pub mod testing;
pub mod transport;

pub use client::{EmitOutcome, PulseClient};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus};
pub use dedup::DuplicateSuppressor;
pub use outbox::PendingQueue;
pub use queue::{BatchQueue, EnqueueOutcome, EventSink, QueueConfigUpdate};
pub use transport::{Connector, Frame, Socket, TungsteniteConnector};
