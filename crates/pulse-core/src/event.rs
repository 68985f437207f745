//! The atomic unit carried through the pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EventId;

/// Closed set of message types understood by the pipeline.
///
/// The serialized names are the on-the-wire `type` strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A captured console call.
    #[serde(rename = "console_event")]
    ConsoleLog,
    /// A captured network fetch.
    #[serde(rename = "network_event")]
    NetworkRequest,
    /// A dispatched Redux action.
    #[serde(rename = "redux_action_event")]
    ReduxAction,
    /// A full Redux state snapshot.
    #[serde(rename = "redux_state_update")]
    ReduxStateUpdate,
    /// Client → server identity announcement.
    #[serde(rename = "handshake")]
    Handshake,
    /// Server → client handshake verdict.
    #[serde(rename = "handshake_acknowledge")]
    HandshakeAck,
    /// Client → server device/app metadata.
    #[serde(rename = "app_info")]
    AppInfo,
    /// An application error report.
    #[serde(rename = "error")]
    Error,
    /// Envelope wrapping several events in one frame.
    #[serde(rename = "batch")]
    Batch,
    /// Liveness probe.
    #[serde(rename = "ping")]
    Ping,
    /// Liveness reply.
    #[serde(rename = "pong")]
    Pong,
}

impl EventType {
    /// Every known type, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::ConsoleLog,
        Self::NetworkRequest,
        Self::ReduxAction,
        Self::ReduxStateUpdate,
        Self::Handshake,
        Self::HandshakeAck,
        Self::AppInfo,
        Self::Error,
        Self::Batch,
        Self::Ping,
        Self::Pong,
    ];

    /// The wire `type` string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConsoleLog => "console_event",
            Self::NetworkRequest => "network_event",
            Self::ReduxAction => "redux_action_event",
            Self::ReduxStateUpdate => "redux_state_update",
            Self::Handshake => "handshake",
            Self::HandshakeAck => "handshake_acknowledge",
            Self::AppInfo => "app_info",
            Self::Error => "error",
            Self::Batch => "batch",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Look up a type by its wire string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Protocol-control types, as opposed to application telemetry.
    #[must_use]
    pub fn is_protocol(self) -> bool {
        matches!(
            self,
            Self::Handshake | Self::HandshakeAck | Self::Batch | Self::Ping | Self::Pong
        )
    }

    /// Whether events of this type go through duplicate suppression.
    #[must_use]
    pub fn participates_in_dedup(self) -> bool {
        self == Self::ReduxAction
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

/// An instrumentation event.
///
/// Immutable once built; identity is [`Event::id`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: EventType,
    payload: Value,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl Event {
    /// Create an event stamped with a fresh ID and the current time.
    #[must_use]
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self::at(event_type, payload, crate::now_ms())
    }

    /// Create an event with an explicit epoch-millisecond timestamp.
    #[must_use]
    pub fn at(event_type: EventType, payload: Value, timestamp: i64) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            payload,
            timestamp,
            session_id: None,
        }
    }

    /// Attribute the event to a session.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Unique event ID.
    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// Event type.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Type-specific payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Epoch milliseconds at creation.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Owning session, if attributed.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names_round_trip_through_parse() {
        for t in EventType::ALL {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&EventType::ReduxAction).unwrap();
        assert_eq!(json, "\"redux_action_event\"");
        let back: EventType = serde_json::from_str("\"handshake_acknowledge\"").unwrap();
        assert_eq!(back, EventType::HandshakeAck);
    }

    #[test]
    fn unknown_type_string() {
        assert!(EventType::parse("telemetry_v2").is_none());
        assert!("telemetry_v2".parse::<EventType>().is_err());
    }

    #[test]
    fn only_redux_actions_are_deduplicated() {
        let dedup: Vec<_> = EventType::ALL
            .into_iter()
            .filter(|t| t.participates_in_dedup())
            .collect();
        assert_eq!(dedup, vec![EventType::ReduxAction]);
    }

    #[test]
    fn events_get_distinct_ids() {
        let a = Event::new(EventType::ConsoleLog, json!({"message": "a"}));
        let b = Event::new(EventType::ConsoleLog, json!({"message": "a"}));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn event_serializes_camel_case() {
        let event = Event::at(EventType::ConsoleLog, json!({"level": "log"}), 42)
            .with_session_id("dev-1");
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "console_event");
        assert_eq!(v["timestamp"], 42);
        assert_eq!(v["sessionId"], "dev-1");
    }
}
