//! Handler registry and dispatch.
//!
//! One table maps a wire `type` to its validator and (optionally) a handler.
//! Every inbound frame goes through [`MessageRegistry::handle`]; `batch`
//! envelopes are unwrapped there and each member takes the same path as a
//! standalone message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use pulse_core::{EventType, PulseError, ValidationError, WireMessage};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::DispatchError;
use crate::parse::{envelope_from_value, parse_envelope};
use crate::validate::{Validator, validator_for};

/// Receives validated messages of one type.
///
/// `C` is the per-connection context the owner passes to
/// [`MessageRegistry::handle`].
#[async_trait]
pub trait MessageHandler<C: Send + Sync>: Send + Sync {
    /// Handle one validated message.
    async fn handle(&self, message: WireMessage, ctx: &C) -> Result<(), PulseError>;
}

#[async_trait]
impl<C, F> MessageHandler<C> for F
where
    C: Send + Sync,
    F: Fn(WireMessage, &C) -> Result<(), PulseError> + Send + Sync,
{
    async fn handle(&self, message: WireMessage, ctx: &C) -> Result<(), PulseError> {
        self(message, ctx)
    }
}

/// What happened to a message that was accepted at the envelope level.
#[derive(Debug)]
pub enum Dispatched {
    /// Validated and passed to its handler.
    Handled(String),
    /// Validated; nothing is registered for the type.
    NoHandler(String),
    /// No validator for the type. Logged and ignored.
    Unknown(String),
    /// A `batch` envelope; one entry per member, in order.
    Batch(Vec<Result<Dispatched, DispatchError>>),
}

impl Dispatched {
    /// Number of handler invocations this dispatch produced.
    #[must_use]
    pub fn handled_count(&self) -> usize {
        match self {
            Self::Handled(_) => 1,
            Self::NoHandler(_) | Self::Unknown(_) => 0,
            Self::Batch(items) => items
                .iter()
                .filter_map(|r| r.as_ref().ok())
                .map(Self::handled_count)
                .sum(),
        }
    }
}

/// `type -> (validator, handler)` table.
pub struct MessageRegistry<C> {
    validators: HashMap<String, Validator>,
    handlers: HashMap<String, Arc<dyn MessageHandler<C>>>,
}

impl<C: Send + Sync> MessageRegistry<C> {
    /// Registry with validators for every [`EventType`] and no handlers.
    pub fn new() -> Self {
        let validators = EventType::ALL
            .into_iter()
            .map(|t| (t.as_str().to_owned(), validator_for(t)))
            .collect();
        Self {
            validators,
            handlers: HashMap::new(),
        }
    }

    /// Add or replace the validator for a type. Registering a validator is
    /// what makes a type "known".
    pub fn register_validator(&mut self, message_type: &str, validator: Validator) {
        let _ = self.validators.insert(message_type.to_owned(), validator);
    }

    /// Add or replace the handler for a type.
    pub fn register(&mut self, message_type: &str, handler: impl MessageHandler<C> + 'static) {
        let _ = self
            .handlers
            .insert(message_type.to_owned(), Arc::new(handler));
    }

    /// Closure form of [`register`](Self::register).
    pub fn on<F>(&mut self, message_type: EventType, handler: F)
    where
        F: Fn(WireMessage, &C) -> Result<(), PulseError> + Send + Sync + 'static,
    {
        self.register(message_type.as_str(), handler);
    }

    /// Whether a handler is registered for the type.
    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Whether the type has a validator.
    pub fn is_known(&self, message_type: &str) -> bool {
        self.validators.contains_key(message_type)
    }

    /// Registered handler types, sorted.
    pub fn handled_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Parse, validate and route one raw frame.
    ///
    /// Errors are logged here; callers may ignore the result. Nothing in
    /// this path should cause the connection to close.
    pub async fn handle(&self, raw: &str, ctx: &C) -> Result<Dispatched, DispatchError> {
        let message = parse_envelope(raw).inspect_err(|e| {
            counter!("messages_rejected_total", "reason" => "parse").increment(1);
            warn!(error = %e, len = raw.len(), "dropping unparseable message");
        })?;
        self.dispatch(message, ctx).await
    }

    /// Validate and route an already-parsed envelope.
    pub async fn dispatch(
        &self,
        message: WireMessage,
        ctx: &C,
    ) -> Result<Dispatched, DispatchError> {
        if message.message_type != EventType::Batch.as_str() {
            return self.dispatch_single(message, ctx).await;
        }

        counter!("messages_received_total", "type" => "batch").increment(1);
        self.validate(&message)?;
        let Value::Object(mut payload) = message.payload else {
            return Ok(Dispatched::Batch(Vec::new()));
        };
        let Some(Value::Array(events)) = payload.remove("events") else {
            return Ok(Dispatched::Batch(Vec::new()));
        };

        debug!(count = events.len(), "unwrapping batch");
        let mut results = Vec::with_capacity(events.len());
        for item in events {
            let result = match envelope_from_value(item) {
                Ok(inner) if inner.message_type == EventType::Batch.as_str() => {
                    let err = ValidationError::new("batch", "nested batch envelope");
                    counter!("messages_rejected_total", "reason" => "validation", "type" => "batch")
                        .increment(1);
                    warn!(error = %err, "dropping batch member");
                    Err(err.into())
                }
                Ok(inner) => self.dispatch_single(inner, ctx).await,
                Err(e) => {
                    counter!("messages_rejected_total", "reason" => "parse").increment(1);
                    warn!(error = %e, "dropping unparseable batch member");
                    Err(e.into())
                }
            };
            results.push(result);
        }
        Ok(Dispatched::Batch(results))
    }

    async fn dispatch_single(
        &self,
        message: WireMessage,
        ctx: &C,
    ) -> Result<Dispatched, DispatchError> {
        let message_type = message.message_type.clone();
        if !self.is_known(&message_type) {
            counter!("messages_unknown_type_total").increment(1);
            warn!(message_type, "unknown message type, ignoring");
            return Ok(Dispatched::Unknown(message_type));
        }
        counter!("messages_received_total", "type" => message_type.clone()).increment(1);
        self.validate(&message)?;

        let Some(handler) = self.handlers.get(&message_type) else {
            debug!(message_type, "no handler registered");
            return Ok(Dispatched::NoHandler(message_type));
        };

        match handler.handle(message, ctx).await {
            Ok(()) => Ok(Dispatched::Handled(message_type)),
            Err(source) => {
                counter!("message_handler_errors_total", "type" => message_type.clone())
                    .increment(1);
                warn!(message_type, error = %source, "handler failed");
                Err(DispatchError::Handler {
                    message_type,
                    source,
                })
            }
        }
    }

    fn validate(&self, message: &WireMessage) -> Result<(), ValidationError> {
        let Some(validator) = self.validators.get(&message.message_type) else {
            return Ok(());
        };
        validator(message).inspect_err(|e| {
            counter!(
                "messages_rejected_total",
                "reason" => "validation",
                "type" => message.message_type.clone()
            )
            .increment(1);
            warn!(message_type = %message.message_type, reason = %e.reason, "dropping invalid message");
        })
    }
}

impl<C: Send + Sync> Default for MessageRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
