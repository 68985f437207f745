//! Per-type payload validators.
//!
//! Shape-free telemetry (console, redux actions, errors) is accepted as is.
//! Typed payloads get structural checks on the fields that are present.
//! Handshake payloads are only checked for kind; missing identity fields are
//! the session layer's concern so the peer gets a rejection instead of
//! silence.

use pulse_core::{EventType, ValidationError, WireMessage};
use serde_json::{Map, Value};

/// Validator signature: inspect an envelope, report the first problem.
pub type Validator = fn(&WireMessage) -> Result<(), ValidationError>;

/// Validator for a known type.
#[must_use]
pub fn validator_for(message_type: EventType) -> Validator {
    match message_type {
        EventType::ConsoleLog
        | EventType::ReduxAction
        | EventType::Error
        | EventType::Handshake
        | EventType::Ping
        | EventType::Pong => permissive,
        EventType::NetworkRequest => network_request,
        EventType::ReduxStateUpdate => redux_state_update,
        EventType::HandshakeAck => handshake_ack,
        EventType::AppInfo => app_info,
        EventType::Batch => batch,
    }
}

/// Accept any payload.
pub fn permissive(_msg: &WireMessage) -> Result<(), ValidationError> {
    Ok(())
}

/// `url` and `method` must be strings and `headers` an object, when present.
pub fn network_request(msg: &WireMessage) -> Result<(), ValidationError> {
    let obj = object_payload(msg)?;
    optional_kind(msg, obj, "url", Value::is_string, "a string")?;
    optional_kind(msg, obj, "method", Value::is_string, "a string")?;
    optional_kind(msg, obj, "headers", Value::is_object, "an object")?;
    Ok(())
}

/// Requires a `state` object.
pub fn redux_state_update(msg: &WireMessage) -> Result<(), ValidationError> {
    let obj = object_payload(msg)?;
    match obj.get("state") {
        Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(invalid(msg, "'state' must be an object")),
        None => Err(invalid(msg, "missing 'state'")),
    }
}

/// Requires `status` to be `connected` or `rejected`.
pub fn handshake_ack(msg: &WireMessage) -> Result<(), ValidationError> {
    let obj = object_payload(msg)?;
    match obj.get("status").and_then(Value::as_str) {
        Some("connected" | "rejected") => Ok(()),
        Some(other) => Err(invalid(msg, format!("unknown status '{other}'"))),
        None => Err(invalid(msg, "missing 'status'")),
    }
}

/// Metadata must be an object.
pub fn app_info(msg: &WireMessage) -> Result<(), ValidationError> {
    object_payload(msg).map(|_| ())
}

/// Requires an `events` array; `count`, when present, must match its length.
pub fn batch(msg: &WireMessage) -> Result<(), ValidationError> {
    let obj = object_payload(msg)?;
    let events = match obj.get("events") {
        Some(Value::Array(events)) => events,
        Some(_) => return Err(invalid(msg, "'events' must be an array")),
        None => return Err(invalid(msg, "missing 'events'")),
    };
    match obj.get("count").map(Value::as_u64) {
        None => Ok(()),
        Some(Some(n)) if usize::try_from(n).is_ok_and(|n| n == events.len()) => Ok(()),
        Some(_) => Err(invalid(
            msg,
            format!("'count' does not match {} events", events.len()),
        )),
    }
}

fn object_payload(msg: &WireMessage) -> Result<&Map<String, Value>, ValidationError> {
    msg.payload
        .as_object()
        .ok_or_else(|| invalid(msg, "payload must be an object"))
}

fn optional_kind(
    msg: &WireMessage,
    obj: &Map<String, Value>,
    field: &str,
    check: fn(&Value) -> bool,
    expected: &str,
) -> Result<(), ValidationError> {
    match obj.get(field) {
        Some(v) if !v.is_null() && !check(v) => {
            Err(invalid(msg, format!("'{field}' must be {expected}")))
        }
        _ => Ok(()),
    }
}

fn invalid(msg: &WireMessage, reason: impl Into<String>) -> ValidationError {
    ValidationError::new(msg.message_type.clone(), reason)
}
