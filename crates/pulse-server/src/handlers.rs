//! Built-in handlers for client-to-server messages.
//!
//! - `handshake`: attach the socket to a device session and acknowledge
//! - `app_info`: replace the session's metadata
//! - telemetry types: attribute to the session and hand to the bridge
//! - `ping` / `pong`: liveness

use pulse_core::{EventType, PulseError, ValidationError, WireMessage};
use pulse_protocol::MessageRegistry;
use tracing::{debug, warn};

use crate::session::AppMetadata;
use crate::websocket::context::SocketContext;

/// Types forwarded to the bridge once a session exists.
pub const TELEMETRY_TYPES: [EventType; 5] = [
    EventType::ConsoleLog,
    EventType::NetworkRequest,
    EventType::ReduxAction,
    EventType::ReduxStateUpdate,
    EventType::Error,
];

/// Install the built-in handlers, replacing any registered for the same
/// types.
pub fn register_all(registry: &mut MessageRegistry<SocketContext>) {
    registry.on(EventType::Handshake, handle_handshake);
    registry.on(EventType::AppInfo, handle_app_info);
    registry.on(EventType::Ping, |_msg, ctx: &SocketContext| {
        let _ = ctx.connection.send_message(&WireMessage::pong());
        Ok(())
    });
    registry.on(EventType::Pong, |_msg, _ctx: &SocketContext| Ok(()));
    for t in TELEMETRY_TYPES {
        registry.on(t, forward_telemetry);
    }
}

fn payload_str<'a>(message: &'a WireMessage, key: &str) -> &'a str {
    message
        .payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

/// A refused handshake is answered, not propagated: the socket stays
/// open so the client can read the reason.
fn handle_handshake(message: WireMessage, ctx: &SocketContext) -> Result<(), PulseError> {
    let device_id = payload_str(&message, "deviceId");
    let platform = payload_str(&message, "platform");
    let conn = &ctx.connection;

    match ctx.sessions.handle_connect(&conn.id, device_id, platform) {
        Ok(session) => {
            let _ = conn.send_message(&WireMessage::handshake_ack_connected(&session.session_id));
            ctx.notify(&session);
        }
        Err(e) => {
            warn!(connection_id = %conn.id, error = %e, "handshake rejected");
            let _ = conn.send_message(&WireMessage::handshake_ack_rejected(&e.to_string()));
        }
    }
    Ok(())
}

fn handle_app_info(message: WireMessage, ctx: &SocketContext) -> Result<(), PulseError> {
    let metadata: AppMetadata = serde_json::from_value(message.payload)
        .map_err(|e| ValidationError::new(EventType::AppInfo.as_str(), e.to_string()))?;
    if let Some(session) = ctx.sessions.update_metadata(&ctx.connection.id, metadata) {
        ctx.notify(&session);
    }
    Ok(())
}

fn forward_telemetry(message: WireMessage, ctx: &SocketContext) -> Result<(), PulseError> {
    let Some(session_id) = ctx.sessions.touch(&ctx.connection.id) else {
        warn!(
            connection_id = %ctx.connection.id,
            message_type = %message.message_type,
            "dropping message received before handshake"
        );
        return Ok(());
    };
    debug!(%session_id, message_type = %message.message_type, "forwarding");
    ctx.bridge.forward(&session_id, &message);
    Ok(())
}
