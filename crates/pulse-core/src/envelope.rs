//! Wire envelope: one JSON object per socket frame.
//!
//! ```text
//! { id, type, timestamp: ISO-8601 | epoch-ms, sessionId?, payload }
//! ```
//!
//! `type` is kept as a raw string so that unknown types survive parsing
//! and can be logged and ignored instead of failing the frame.

use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Value, json};

use crate::event::{Event, EventType};
use crate::ids::EventId;

/// Envelope timestamp, accepted in either wire representation.
///
/// Fractional epoch milliseconds are truncated; strings must be RFC 3339.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Milliseconds since the Unix epoch.
    EpochMs(i64),
    /// RFC 3339 / ISO-8601 string.
    Iso8601(String),
}

impl Timestamp {
    /// Current time as epoch milliseconds.
    #[must_use]
    pub fn now() -> Self {
        Self::EpochMs(crate::now_ms())
    }

    /// Normalize to epoch milliseconds. `None` for an unparseable string.
    #[must_use]
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Self::EpochMs(ms) => Some(*ms),
            Self::Iso8601(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Int(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Timestamp {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Int(ms) => Ok(Self::EpochMs(ms)),
            RawTimestamp::Float(ms) if ms.is_finite() && ms.abs() < i64::MAX as f64 => {
                Ok(Self::EpochMs(ms.trunc() as i64))
            }
            RawTimestamp::Float(ms) => Err(de::Error::custom(format!(
                "timestamp {ms} is out of range"
            ))),
            RawTimestamp::Text(text) => match chrono::DateTime::parse_from_rfc3339(&text) {
                Ok(_) => Ok(Self::Iso8601(text)),
                Err(e) => Err(de::Error::custom(format!(
                    "timestamp {text:?} is not RFC 3339: {e}"
                ))),
            },
        }
    }
}

/// A message as it travels over the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Message ID (may be empty on messages from lenient peers).
    #[serde(default)]
    pub id: String,
    /// Raw type tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Creation time.
    pub timestamp: Timestamp,
    /// Owning session, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Type-specific body.
    #[serde(default)]
    pub payload: Value,
}

impl WireMessage {
    /// Build a protocol message of the given type with a fresh ID.
    #[must_use]
    pub fn protocol(message_type: EventType, payload: Value) -> Self {
        Self {
            id: EventId::new().into_inner(),
            message_type: message_type.as_str().to_owned(),
            timestamp: Timestamp::now(),
            session_id: None,
            payload,
        }
    }

    /// Wrap an instrumentation event.
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: event.id().to_string(),
            message_type: event.event_type().as_str().to_owned(),
            timestamp: Timestamp::EpochMs(event.timestamp()),
            session_id: event.session_id().map(str::to_owned),
            payload: event.payload().clone(),
        }
    }

    /// Wrap several events into a single `batch` envelope.
    #[must_use]
    pub fn batch(events: &[Event]) -> Self {
        let items: Vec<Value> = events
            .iter()
            .filter_map(|e| serde_json::to_value(Self::from_event(e)).ok())
            .collect();
        let count = items.len();
        Self::protocol(
            EventType::Batch,
            json!({
                "events": items,
                "count": count,
                "timestamp": crate::now_ms(),
            }),
        )
    }

    /// Client handshake announcing device identity and monitoring flags.
    ///
    /// `deviceId` and `platform` always come from the arguments, even if
    /// `extra` carries keys of the same name.
    #[must_use]
    pub fn handshake(device_id: &str, platform: &str, extra: Value) -> Self {
        let mut payload = match extra {
            Value::Object(extra) => extra,
            _ => serde_json::Map::new(),
        };
        let _ = payload.insert("deviceId".into(), Value::from(device_id));
        let _ = payload.insert("platform".into(), Value::from(platform));
        Self::protocol(EventType::Handshake, Value::Object(payload))
    }

    /// Accepting handshake verdict.
    #[must_use]
    pub fn handshake_ack_connected(session_id: &str) -> Self {
        Self::protocol(
            EventType::HandshakeAck,
            json!({ "status": "connected", "sessionId": session_id }),
        )
        .with_session_id(session_id)
    }

    /// Rejecting handshake verdict.
    #[must_use]
    pub fn handshake_ack_rejected(reason: &str) -> Self {
        Self::protocol(
            EventType::HandshakeAck,
            json!({ "status": "rejected", "reason": reason }),
        )
    }

    /// Liveness probe.
    #[must_use]
    pub fn ping() -> Self {
        Self::protocol(EventType::Ping, Value::Null)
    }

    /// Liveness reply.
    #[must_use]
    pub fn pong() -> Self {
        Self::protocol(EventType::Pong, Value::Null)
    }

    /// Stamp a session ID.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// The known type, if the tag is in the closed set.
    #[must_use]
    pub fn kind(&self) -> Option<EventType> {
        EventType::parse(&self.message_type)
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_epoch_ms_timestamp() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"id":"1","type":"ping","timestamp":1700000000000}"#).unwrap();
        assert_eq!(msg.timestamp.as_millis(), Some(1_700_000_000_000));
        assert_eq!(msg.payload, Value::Null);
    }

    #[test]
    fn accepts_iso_timestamp() {
        let msg: WireMessage = serde_json::from_str(
            r#"{"id":"1","type":"ping","timestamp":"2024-01-01T00:00:00.000Z"}"#,
        )
        .unwrap();
        assert_eq!(msg.timestamp.as_millis(), Some(1_704_067_200_000));
    }

    #[test]
    fn fractional_epoch_ms_is_truncated() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"type":"ping","timestamp":1700000000000.5}"#).unwrap();
        assert_eq!(msg.timestamp, Timestamp::EpochMs(1_700_000_000_000));
    }

    #[test]
    fn non_rfc3339_string_is_rejected() {
        let err = serde_json::from_str::<WireMessage>(r#"{"type":"ping","timestamp":"banana"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("RFC 3339"));
    }

    #[test]
    fn unknown_type_is_preserved() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"type":"future_thing","timestamp":1}"#).unwrap();
        assert_eq!(msg.message_type, "future_thing");
        assert!(msg.kind().is_none());
        assert!(msg.id.is_empty());
    }

    #[test]
    fn batch_envelope_carries_count_and_events() {
        let events = vec![
            Event::new(EventType::ConsoleLog, json!({"message": "a"})),
            Event::new(EventType::NetworkRequest, json!({"url": "/x"})),
        ];
        let batch = WireMessage::batch(&events);
        assert_eq!(batch.kind(), Some(EventType::Batch));
        assert_eq!(batch.payload["count"], 2);
        assert_eq!(batch.payload["events"][0]["type"], "console_event");
        assert_eq!(batch.payload["events"][1]["payload"]["url"], "/x");
        assert!(batch.payload["timestamp"].is_i64());
    }

    #[test]
    fn from_event_keeps_identity() {
        let event = Event::at(EventType::Error, json!({"message": "boom"}), 7);
        let msg = WireMessage::from_event(&event);
        assert_eq!(msg.id, event.id().as_str());
        assert_eq!(msg.timestamp, Timestamp::EpochMs(7));
    }

    #[test]
    fn handshake_merges_extra_fields() {
        let msg = WireMessage::handshake("dev-1", "ios", json!({"monitoring": {"redux": true}}));
        assert_eq!(msg.payload["deviceId"], "dev-1");
        assert_eq!(msg.payload["platform"], "ios");
        assert_eq!(msg.payload["monitoring"]["redux"], true);
    }

    #[test]
    fn handshake_extra_cannot_override_identity() {
        let msg = WireMessage::handshake(
            "dev-1",
            "ios",
            json!({"deviceId": "spoofed", "platform": "web", "appName": "Shop"}),
        );
        assert_eq!(msg.payload["deviceId"], "dev-1");
        assert_eq!(msg.payload["platform"], "ios");
        assert_eq!(msg.payload["appName"], "Shop");
    }

    #[test]
    fn rejected_ack_has_reason() {
        let msg = WireMessage::handshake_ack_rejected("missing deviceId");
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "handshake_acknowledge");
        assert_eq!(v["payload"]["status"], "rejected");
        assert_eq!(v["payload"]["reason"], "missing deviceId");
        assert!(v.get("sessionId").is_none());
    }
}
