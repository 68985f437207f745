//! Dispatch errors.

use pulse_core::{ParseError, PulseError, ValidationError};
use thiserror::Error;

/// Why a message did not reach (or failed inside) its handler.
///
/// None of these terminate the connection; callers log and move on.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The frame is not a usable envelope.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The payload failed its type's validator.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The handler ran and reported a failure.
    #[error("handler for '{message_type}' failed: {source}")]
    Handler {
        /// Wire type that was being handled.
        message_type: String,
        /// What the handler returned.
        #[source]
        source: PulseError,
    },
}

impl DispatchError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => pulse_core::errors::PARSE_ERROR,
            Self::Validation(_) => pulse_core::errors::VALIDATION_ERROR,
            Self::Handler { source, .. } => source.code(),
        }
    }
}
