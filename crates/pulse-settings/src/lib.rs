//! # pulse-settings
//!
//! Configuration with layered sources for the Pulse client and server.
//!
//! Settings are loaded from three layers, lowest priority first:
//! 1. compiled defaults ([`PulseSettings::default()`])
//! 2. `~/.pulse/settings.json`, deep-merged over the defaults
//! 3. `PULSE_*` environment variables
//!
//! There is no global instance: load once and pass the value to whatever
//! needs it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
