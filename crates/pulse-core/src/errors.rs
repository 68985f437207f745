//! Error taxonomy for the pipeline.
//!
//! - [`ParseError`]: the frame is not a usable envelope
//! - [`ValidationError`]: the envelope parsed but its payload has the wrong shape
//! - [`TransportError`]: socket-level failure (drives the reconnect path)
//! - [`SessionError`]: handshake or session bookkeeping failure
//! - [`PulseError`]: umbrella enum with `#[from]` conversions
//!
//! Unknown message types are deliberately *not* an error.

use thiserror::Error;

/// Machine-readable code for [`ParseError`].
pub const PARSE_ERROR: &str = "PARSE_ERROR";
/// Machine-readable code for [`ValidationError`].
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Machine-readable code for [`TransportError`].
pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
/// Machine-readable code for [`SessionError`].
pub const SESSION_ERROR: &str = "SESSION_ERROR";

/// A frame could not be turned into an envelope.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON, but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,
    /// A required envelope field is absent.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    /// Fields are present but have the wrong kind.
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Payload failed its type's shape check.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid {message_type} payload: {reason}")]
pub struct ValidationError {
    /// Wire type of the rejected message.
    pub message_type: String,
    /// What was wrong.
    pub reason: String,
}

impl ValidationError {
    /// Create a validation error.
    #[must_use]
    pub fn new(message_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            reason: reason.into(),
        }
    }
}

/// Socket-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open the socket.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying cause.
        message: String,
    },
    /// Opening the socket took too long.
    #[error("connection to {url} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target URL.
        url: String,
        /// Limit that elapsed.
        timeout_ms: u64,
    },
    /// The socket is not open.
    #[error("socket is closed")]
    Closed,
    /// The peer stopped answering pings.
    #[error("no pong received within {timeout_ms}ms")]
    Unresponsive {
        /// Limit that elapsed.
        timeout_ms: u64,
    },
}

/// Session bookkeeping failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Handshake lacked `deviceId` or `platform`.
    #[error("handshake missing required field '{0}'")]
    MissingField(&'static str),
    /// The server refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Unusable frame.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Payload shape mismatch.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Socket failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Session failure.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl PulseError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::Validation(_) => VALIDATION_ERROR,
            Self::Transport(_) => TRANSPORT_ERROR,
            Self::Session(_) => SESSION_ERROR,
        }
    }

    /// Whether the reconnect path should run after this error.
    #[must_use]
    pub fn triggers_reconnect(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
