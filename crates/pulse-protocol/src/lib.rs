//! # pulse-protocol
//!
//! Message handling shared by both ends of a Pulse socket.
//!
//! - [`parse_envelope`]: raw text frame to [`WireMessage`](pulse_core::WireMessage)
//! - [`validate`]: per-type payload shape checks
//! - [`MessageRegistry`]: `type -> handler` table with a single
//!   [`handle`](MessageRegistry::handle) entry point that also unwraps
//!   `batch` envelopes

#![deny(unsafe_code)]

pub mod dispatch;
pub mod errors;
pub mod parse;
pub mod validate;

pub use dispatch::{Dispatched, MessageHandler, MessageRegistry};
pub use errors::DispatchError;
pub use parse::parse_envelope;
pub use validate::Validator;
