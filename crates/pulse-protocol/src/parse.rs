//! Envelope parsing.

use pulse_core::{ParseError, WireMessage};
use serde_json::Value;

/// Parse a text frame into an envelope.
///
/// Fails fast when the frame is not JSON, not an object, or lacks `type` or
/// `timestamp`. The `type` value is not checked against the known set here.
pub fn parse_envelope(raw: &str) -> Result<WireMessage, ParseError> {
    let value: Value = serde_json::from_str(raw)?;
    envelope_from_value(value)
}

/// Same checks as [`parse_envelope`] for an already-decoded value, used for
/// the members of a `batch` envelope.
pub fn envelope_from_value(value: Value) -> Result<WireMessage, ParseError> {
    let Some(obj) = value.as_object() else {
        return Err(ParseError::NotAnObject);
    };
    match obj.get("type") {
        None | Some(Value::Null) => return Err(ParseError::MissingField("type")),
        Some(Value::String(_)) => {}
        Some(_) => return Err(ParseError::Malformed("'type' must be a string".into())),
    }
    if obj.get("timestamp").is_none_or(Value::is_null) {
        return Err(ParseError::MissingField("timestamp"));
    }
    serde_json::from_value(value).map_err(|e| ParseError::Malformed(e.to_string()))
}
