//! Settings loading: defaults, then `~/.pulse/settings.json`, then `PULSE_*`
//! environment variables.
//!
//! Merge rules for the file layer:
//! - objects merge per key, recursively
//! - arrays and primitives in the file replace the default
//! - `null` in the file keeps the default

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::PulseSettings;

/// `~/.pulse/settings.json`
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pulse").join("settings.json")
}

/// Load from the default path and apply env overrides.
pub fn load_settings() -> Result<PulseSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` and apply env overrides.
///
/// A missing file yields defaults. Malformed JSON or values that fail
/// [`PulseSettings::validate`] are errors.
pub fn load_settings_from_path(path: &Path) -> Result<PulseSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<PulseSettings> {
    let defaults = serde_json::to_value(PulseSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive merge of `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PULSE_*` overrides. Unparseable or out-of-range values are logged
/// and skipped.
pub fn apply_env_overrides(settings: &mut PulseSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Tests pass a map here instead
/// of mutating the process environment.
pub fn apply_overrides_from<F>(settings: &mut PulseSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // Both sides share host/port: the client dials what the server binds.
    if let Some(v) = env.string("PULSE_HOST") {
        settings.client.host.clone_from(&v);
        settings.server.host = v;
    }
    if let Some(v) = env.u16("PULSE_PORT", 1, 65535) {
        settings.client.port = v;
        settings.server.port = v;
    }
    if let Some(v) = env.string("PULSE_DEVICE_ID") {
        settings.client.device_id = Some(v);
    }
    if let Some(v) = env.string("PULSE_PLATFORM") {
        settings.client.platform = v;
    }
    if let Some(v) = env.string("PULSE_LOG_LEVEL") {
        settings.logging.level = v;
    }

    let batching = &mut settings.client.batching;
    if let Some(v) = env.usize("PULSE_BATCH_SIZE", 1, 10_000) {
        batching.batch_size = v;
    }
    if let Some(v) = env.u64("PULSE_BATCH_TIMEOUT_MS", 1, 600_000) {
        batching.batch_timeout_ms = v;
    }
    if let Some(v) = env.u64("PULSE_THROTTLE_INTERVAL_MS", 0, 600_000) {
        batching.throttle_interval_ms = v;
    }
    if let Some(v) = env.bool("PULSE_ENABLE_BATCHING") {
        batching.enable_batching = v;
    }
    if let Some(v) = env.bool("PULSE_ENABLE_THROTTLING") {
        batching.enable_throttling = v;
    }

    if let Some(v) = env.usize("PULSE_MAX_CONNECTIONS", 1, 10_000) {
        settings.server.max_connections = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` within `min..=max`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
