//! Device sessions.
//!
//! A session is keyed by `deviceId` and outlives any one socket: a device
//! that reconnects is reattached to its existing session with its metadata
//! intact. Sockets are correlated through a `connection -> device` side
//! table kept in step with the session map under one lock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::RwLock;
use pulse_core::{ConnectionId, DeviceId, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a device currently has a socket attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// A socket is attached.
    Connected,
    /// The last socket closed; the session is kept until evicted.
    Disconnected,
}

/// Device and application details. Holds only `platform` until the
/// device sends `app_info`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    /// OS family reported in the handshake.
    #[serde(default)]
    pub platform: String,
    /// Application name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Application version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// Device model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    /// OS version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Anything else the app reported.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AppMetadata {
    /// Metadata known right after a handshake.
    pub fn for_platform(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Self::default()
        }
    }
}

/// Snapshot of one device session. Never carries the socket handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Stable device identity.
    pub device_id: DeviceId,
    /// Server-minted ID, returned in `handshake_acknowledge`. Stable across
    /// reattachment.
    pub session_id: String,
    /// Latest metadata.
    pub metadata: AppMetadata,
    /// When the current (or last) socket attached.
    pub connected_at: DateTime<Utc>,
    /// Last connect, metadata update, message or disconnect.
    pub last_active_at: DateTime<Utc>,
    /// Connection status.
    pub status: SessionStatus,
}

struct Entry {
    session: Session,
    socket: Option<ConnectionId>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<DeviceId, Entry>,
    by_socket: HashMap<ConnectionId, DeviceId>,
}

impl Tables {
    /// Detach whatever session `socket` is attached to.
    fn detach(&mut self, socket: &ConnectionId, now: DateTime<Utc>) -> Option<Session> {
        let device_id = self.by_socket.remove(socket)?;
        let entry = self.sessions.get_mut(&device_id)?;
        if entry.socket.as_ref() != Some(socket) {
            return None;
        }
        entry.socket = None;
        entry.session.status = SessionStatus::Disconnected;
        entry.session.last_active_at = now;
        Some(entry.session.clone())
    }

    fn attached_mut(&mut self, socket: &ConnectionId) -> Option<&mut Entry> {
        let device_id = self.by_socket.get(socket)?;
        self.sessions
            .get_mut(device_id)
            .filter(|e| e.socket.as_ref() == Some(socket))
    }
}

/// Tracks one [`Session`] per device.
#[derive(Default)]
pub struct SessionManager {
    tables: RwLock<Tables>,
}

impl SessionManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `socket` to the session for `device_id`, creating it on first
    /// sight.
    ///
    /// Reattaching keeps the session's metadata and ID. A socket that was
    /// attached to a different device is detached from it first, and a
    /// socket previously attached to this device loses its mapping.
    pub fn handle_connect(
        &self,
        socket: &ConnectionId,
        device_id: &str,
        platform: &str,
    ) -> Result<Session, SessionError> {
        if device_id.is_empty() {
            return Err(SessionError::MissingField("deviceId"));
        }
        if platform.is_empty() {
            return Err(SessionError::MissingField("platform"));
        }

        let now = Utc::now();
        let device_id = DeviceId::from(device_id);
        let mut tables = self.tables.write();

        if tables.by_socket.get(socket) != Some(&device_id) {
            let _ = tables.detach(socket, now);
        }

        let (snapshot, replaced) = match tables.sessions.get_mut(&device_id) {
            Some(entry) => {
                let replaced = entry.socket.replace(socket.clone()).filter(|old| old != socket);
                entry.session.status = SessionStatus::Connected;
                entry.session.connected_at = now;
                entry.session.last_active_at = now;
                info!(%device_id, connection_id = %socket, "session reattached");
                counter!("sessions_reattached_total").increment(1);
                (entry.session.clone(), replaced)
            }
            None => {
                let session = Session {
                    device_id: device_id.clone(),
                    session_id: Uuid::now_v7().to_string(),
                    metadata: AppMetadata::for_platform(platform),
                    connected_at: now,
                    last_active_at: now,
                    status: SessionStatus::Connected,
                };
                let _ = tables.sessions.insert(
                    device_id.clone(),
                    Entry {
                        session: session.clone(),
                        socket: Some(socket.clone()),
                    },
                );
                info!(%device_id, connection_id = %socket, platform, "session created");
                counter!("sessions_created_total").increment(1);
                (session, None)
            }
        };

        if let Some(old) = replaced {
            let _ = tables.by_socket.remove(&old);
            debug!(%device_id, old_connection = %old, "previous socket superseded");
        }
        let _ = tables.by_socket.insert(socket.clone(), device_id);
        Ok(snapshot)
    }

    /// Replace the metadata of the session attached to `socket`.
    ///
    /// An empty `platform` keeps the one from the handshake. Returns `None`
    /// (and logs) when no session is attached.
    pub fn update_metadata(
        &self,
        socket: &ConnectionId,
        mut metadata: AppMetadata,
    ) -> Option<Session> {
        let mut tables = self.tables.write();
        let Some(entry) = tables.attached_mut(socket) else {
            drop(tables);
            warn!(connection_id = %socket, "metadata for socket without a session");
            return None;
        };
        if metadata.platform.is_empty() {
            metadata.platform = std::mem::take(&mut entry.session.metadata.platform);
        }
        entry.session.metadata = metadata;
        entry.session.last_active_at = Utc::now();
        Some(entry.session.clone())
    }

    /// Mark the session attached to `socket` disconnected. Safe to call
    /// for sockets that never completed a handshake or already closed.
    pub fn handle_disconnect(&self, socket: &ConnectionId) -> Option<Session> {
        let detached = self.tables.write().detach(socket, Utc::now());
        match &detached {
            Some(session) => {
                info!(device_id = %session.device_id, connection_id = %socket, "session disconnected");
            }
            None => debug!(connection_id = %socket, "disconnect for socket without a session"),
        }
        detached
    }

    /// Record activity on `socket`; returns the attached session's ID.
    pub fn touch(&self, socket: &ConnectionId) -> Option<String> {
        let mut tables = self.tables.write();
        let entry = tables.attached_mut(socket)?;
        entry.session.last_active_at = Utc::now();
        Some(entry.session.session_id.clone())
    }

    /// Snapshot of the session attached to `socket`.
    pub fn session_for_socket(&self, socket: &ConnectionId) -> Option<Session> {
        let tables = self.tables.read();
        let device_id = tables.by_socket.get(socket)?;
        tables
            .sessions
            .get(device_id)
            .filter(|e| e.socket.as_ref() == Some(socket))
            .map(|e| e.session.clone())
    }

    /// Snapshot of one session.
    pub fn get_session(&self, device_id: &str) -> Option<Session> {
        self.tables
            .read()
            .sessions
            .get(device_id)
            .map(|e| e.session.clone())
    }

    /// Snapshots of every session, oldest connection first.
    pub fn get_all_sessions(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self
            .tables
            .read()
            .sessions
            .values()
            .map(|e| e.session.clone())
            .collect();
        all.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        all
    }

    /// Remove a disconnected session. Connected sessions are kept.
    pub fn evict(&self, device_id: &str) -> bool {
        let mut tables = self.tables.write();
        let disconnected = tables
            .sessions
            .get(device_id)
            .is_some_and(|e| e.socket.is_none());
        if disconnected {
            let _ = tables.sessions.remove(device_id);
            info!(device_id, "session evicted");
        }
        disconnected
    }

    /// Remove disconnected sessions idle for longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Utc::now())
    }

    /// [`evict_idle`](Self::evict_idle) against an explicit clock.
    pub fn evict_idle_at(&self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::MAX);
        let mut tables = self.tables.write();
        let before = tables.sessions.len();
        tables.sessions.retain(|_, e| {
            e.socket.is_some() || now.signed_duration_since(e.session.last_active_at) <= max_idle
        });
        let evicted = before - tables.sessions.len();
        if evicted > 0 {
            info!(evicted, "evicted idle sessions");
        }
        evicted
    }

    /// Number of sessions, connected or not.
    pub fn len(&self) -> usize {
        self.tables.read().sessions.len()
    }

    /// Whether no session exists.
    pub fn is_empty(&self) -> bool {
        self.tables.read().sessions.is_empty()
    }

    /// Sessions with a socket attached.
    pub fn connected_count(&self) -> usize {
        self.tables
            .read()
            .sessions
            .values()
            .filter(|e| e.socket.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn sock() -> ConnectionId {
        ConnectionId::new()
    }

    #[test]
    fn first_handshake_creates_session_with_platform_only() {
        let mgr = SessionManager::new();
        let ws = sock();
        let s = mgr.handle_connect(&ws, "dev-1", "ios").unwrap();
        assert_eq!(s.device_id.as_str(), "dev-1");
        assert_eq!(s.status, SessionStatus::Connected);
        assert_eq!(s.metadata, AppMetadata::for_platform("ios"));
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.connected_count(), 1);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mgr = SessionManager::new();
        assert_matches!(
            mgr.handle_connect(&sock(), "", "ios"),
            Err(SessionError::MissingField("deviceId"))
        );
        assert_matches!(
            mgr.handle_connect(&sock(), "dev-1", ""),
            Err(SessionError::MissingField("platform"))
        );
        assert!(mgr.is_empty());
    }

    #[test]
    fn reconnect_reattaches_and_keeps_metadata() {
        let mgr = SessionManager::new();
        let ws1 = sock();
        let first = mgr.handle_connect(&ws1, "dev-1", "android").unwrap();
        let meta = AppMetadata {
            app_name: Some("Shop".into()),
            app_version: Some("2.1.0".into()),
            ..AppMetadata::default()
        };
        let _ = mgr.update_metadata(&ws1, meta).unwrap();
        let _ = mgr.handle_disconnect(&ws1).unwrap();
        assert_eq!(mgr.get_session("dev-1").unwrap().status, SessionStatus::Disconnected);

        let ws2 = sock();
        let again = mgr.handle_connect(&ws2, "dev-1", "android").unwrap();
        assert_eq!(mgr.get_all_sessions().len(), 1);
        assert_eq!(again.session_id, first.session_id);
        assert_eq!(again.status, SessionStatus::Connected);
        assert_eq!(again.metadata.app_name.as_deref(), Some("Shop"));
        assert_eq!(again.metadata.platform, "android");
        assert_eq!(mgr.get_session("dev-1").unwrap().status, SessionStatus::Connected);
    }

    #[test]
    fn superseded_socket_no_longer_routes() {
        let mgr = SessionManager::new();
        let ws1 = sock();
        let ws2 = sock();
        let _ = mgr.handle_connect(&ws1, "dev-1", "ios").unwrap();
        let _ = mgr.handle_connect(&ws2, "dev-1", "ios").unwrap();

        assert!(mgr.touch(&ws1).is_none());
        assert!(mgr.touch(&ws2).is_some());
        // Late close of the old socket must not disconnect the new one
        assert!(mgr.handle_disconnect(&ws1).is_none());
        assert_eq!(mgr.get_session("dev-1").unwrap().status, SessionStatus::Connected);
    }

    #[test]
    fn socket_switching_device_detaches_previous_session() {
        let mgr = SessionManager::new();
        let ws = sock();
        let _ = mgr.handle_connect(&ws, "dev-1", "ios").unwrap();
        let _ = mgr.handle_connect(&ws, "dev-2", "ios").unwrap();

        assert_eq!(mgr.get_session("dev-1").unwrap().status, SessionStatus::Disconnected);
        assert_eq!(mgr.session_for_socket(&ws).unwrap().device_id.as_str(), "dev-2");
        assert_eq!(mgr.connected_count(), 1);
    }

    #[test]
    fn repeated_handshake_on_same_socket_is_idempotent() {
        let mgr = SessionManager::new();
        let ws = sock();
        let a = mgr.handle_connect(&ws, "dev-1", "ios").unwrap();
        let b = mgr.handle_connect(&ws, "dev-1", "ios").unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(mgr.connected_count(), 1);
        assert!(mgr.touch(&ws).is_some());
    }

    #[test]
    fn metadata_update_replaces_wholesale() {
        let mgr = SessionManager::new();
        let ws = sock();
        let _ = mgr.handle_connect(&ws, "dev-1", "ios").unwrap();
        let first: AppMetadata =
            serde_json::from_value(json!({"appName": "A", "deviceModel": "iPhone15,2"})).unwrap();
        let _ = mgr.update_metadata(&ws, first).unwrap();
        let second: AppMetadata =
            serde_json::from_value(json!({"appName": "B", "locale": "en-US"})).unwrap();
        let s = mgr.update_metadata(&ws, second).unwrap();

        assert_eq!(s.metadata.app_name.as_deref(), Some("B"));
        assert!(s.metadata.device_model.is_none());
        assert_eq!(s.metadata.platform, "ios");
        assert_eq!(s.metadata.extra["locale"], "en-US");
    }

    #[test]
    fn metadata_for_unknown_socket_is_noop() {
        let mgr = SessionManager::new();
        assert!(mgr.update_metadata(&sock(), AppMetadata::default()).is_none());
    }

    #[test]
    fn double_disconnect_is_noop() {
        let mgr = SessionManager::new();
        let ws = sock();
        let _ = mgr.handle_connect(&ws, "dev-1", "ios").unwrap();
        assert!(mgr.handle_disconnect(&ws).is_some());
        assert!(mgr.handle_disconnect(&ws).is_none());
        assert!(mgr.handle_disconnect(&sock()).is_none());
    }

    #[test]
    fn snapshots_serialize_without_socket() {
        let mgr = SessionManager::new();
        let _ = mgr.handle_connect(&sock(), "dev-1", "web").unwrap();
        let v = serde_json::to_value(mgr.get_all_sessions()).unwrap();
        let obj = v[0].as_object().unwrap();
        assert_eq!(obj["deviceId"], "dev-1");
        assert_eq!(obj["status"], "connected");
        assert_eq!(obj["metadata"]["platform"], "web");
        assert!(obj.contains_key("lastActiveAt"));
        assert!(!obj.contains_key("socket"));
    }

    #[test]
    fn evict_only_removes_disconnected() {
        let mgr = SessionManager::new();
        let ws = sock();
        let _ = mgr.handle_connect(&ws, "dev-1", "ios").unwrap();
        assert!(!mgr.evict("dev-1"));
        let _ = mgr.handle_disconnect(&ws);
        assert!(mgr.evict("dev-1"));
        assert!(mgr.get_session("dev-1").is_none());
        assert!(!mgr.evict("dev-1"));
    }

    #[test]
    fn evict_idle_respects_age_and_status() {
        let mgr = SessionManager::new();
        let (a, b) = (sock(), sock());
        let _ = mgr.handle_connect(&a, "idle", "ios").unwrap();
        let _ = mgr.handle_connect(&b, "live", "ios").unwrap();
        let _ = mgr.handle_disconnect(&a);

        let now = Utc::now();
        assert_eq!(mgr.evict_idle_at(Duration::from_secs(60), now), 0);

        let later = now + chrono::Duration::seconds(120);
        assert_eq!(mgr.evict_idle_at(Duration::from_secs(60), later), 1);
        assert!(mgr.get_session("idle").is_none());
        assert!(mgr.get_session("live").is_some());
    }
}
