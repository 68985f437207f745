//! Client-side (instrumented app) settings.

use pulse_core::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Connection, queueing and liveness settings for the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Desktop tool host.
    pub host: String,
    /// Desktop tool port.
    pub port: u16,
    /// Stable device identity. Generated per process when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Platform name sent in the handshake (`ios`, `android`, …).
    pub platform: String,
    /// Application name sent in the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Which instrumentation sources the desktop tool should expect.
    pub monitoring: MonitoringFlags,
    /// Outgoing queue behaviour.
    pub batching: BatchingSettings,
    /// Reconnect policy.
    pub reconnect: ReconnectSettings,
    /// Ping/pong health check.
    pub health_check: HealthCheckSettings,
    /// Cap on messages held while disconnected (oldest dropped first).
    pub max_pending_messages: usize,
    /// Duplicate-suppression window in milliseconds.
    pub dedup_ttl_ms: u64,
    /// Limit for opening the socket, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8347,
            device_id: None,
            platform: "unknown".into(),
            app_name: None,
            monitoring: MonitoringFlags::default(),
            batching: BatchingSettings::default(),
            reconnect: ReconnectSettings::default(),
            health_check: HealthCheckSettings::default(),
            max_pending_messages: 1000,
            dedup_ttl_ms: 5000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ClientSettings {
    /// `ws://host:port`
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Instrumentation sources requested in the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringFlags {
    /// Console interception.
    pub console: bool,
    /// Network interception.
    pub network: bool,
    /// Redux middleware.
    pub redux: bool,
}

impl Default for MonitoringFlags {
    fn default() -> Self {
        Self {
            console: true,
            network: true,
            redux: true,
        }
    }
}

/// Batching and throttling of outgoing events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchingSettings {
    /// Buffer events and send them together.
    pub enable_batching: bool,
    /// Flush as soon as this many events are buffered.
    pub batch_size: usize,
    /// Flush a non-full buffer after this long.
    pub batch_timeout_ms: u64,
    /// Drop events of a type sent more recently than the interval.
    pub enable_throttling: bool,
    /// Minimum spacing between two sends of the same type.
    pub throttle_interval_ms: u64,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            enable_batching: true,
            batch_size: 10,
            batch_timeout_ms: 1000,
            enable_throttling: false,
            throttle_interval_ms: 100,
        }
    }
}

/// Reconnect policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Reconnect automatically after an unexpected close.
    pub enabled: bool,
    /// Backoff parameters.
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Application-level ping/pong settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckSettings {
    /// Probe while connected.
    pub enabled: bool,
    /// Time between probes.
    pub interval_ms: u64,
    /// How long to wait for a pong.
    pub timeout_ms: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 15_000,
            timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_from_host_and_port() {
        let s = ClientSettings {
            host: "10.0.2.2".into(),
            port: 9000,
            ..ClientSettings::default()
        };
        assert_eq!(s.url(), "ws://10.0.2.2:9000");
    }

    #[test]
    fn reconnect_flattens_backoff() {
        let s: ReconnectSettings =
            serde_json::from_str(r#"{"enabled":false,"maxDelayMs":5000}"#).unwrap();
        assert!(!s.enabled);
        assert_eq!(s.backoff.max_delay_ms, 5000);
        assert_eq!(s.backoff.base_delay_ms, 1000);
    }

    #[test]
    fn partial_batching_keeps_defaults() {
        let b: BatchingSettings = serde_json::from_str(r#"{"batchSize":3}"#).unwrap();
        assert_eq!(b.batch_size, 3);
        assert!(b.enable_batching);
        assert_eq!(b.batch_timeout_ms, 1000);
    }
}
