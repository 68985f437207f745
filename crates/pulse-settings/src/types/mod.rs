//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial JSON file only needs
//! the keys it overrides.

mod client;
mod server;

pub use client::{BatchingSettings, ClientSettings, HealthCheckSettings, MonitoringFlags, ReconnectSettings};
pub use server::ServerSettings;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseSettings {
    /// Instrumented-app side.
    pub client: ClientSettings,
    /// Desktop-tool side.
    pub server: ServerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl PulseSettings {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.client.batching.batch_size == 0 {
            return Err(SettingsError::InvalidValue(
                "client.batching.batchSize must be at least 1".into(),
            ));
        }
        if self.client.health_check.enabled && self.client.health_check.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "client.healthCheck.intervalMs must be positive".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be positive".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PulseSettings::default().validate().is_ok());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut s = PulseSettings::default();
        s.client.batching.batch_size = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("batchSize"));
    }

    #[test]
    fn zero_max_connections_rejected() {
        let mut s = PulseSettings::default();
        s.server.max_connections = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn camel_case_keys() {
        let v = serde_json::to_value(PulseSettings::default()).unwrap();
        assert!(v["client"]["batching"]["enableBatching"].is_boolean());
        assert!(v["client"]["maxPendingMessages"].is_u64());
        assert!(v["server"]["heartbeatIntervalSecs"].is_u64());
    }
}
