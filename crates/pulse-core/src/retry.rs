//! Reconnect backoff calculation.
//!
//! Sync-only building blocks; the client's reconnect timer lives in
//! `pulse-client`.
//!
//! - [`BackoffPolicy`]: base delay, ceiling, jitter
//! - [`calculate_backoff_delay_with_random`]: exponential backoff with jitter

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0 to 1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff parameters. There is no attempt cap: only the delay
/// is bounded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry, in ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling for any single delay, in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter range 0.0 to 1.0 applied symmetrically around the delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Fixed delay with no growth and no jitter.
    #[must_use]
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter_factor: 0.0,
        }
    }

    /// Delay for a zero-based `attempt`, given `random` in `[0.0, 1.0)`.
    #[must_use]
    pub fn delay(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }
}

/// Calculate backoff delay with explicit randomness.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 + (random*2-1) * jitter)`.
/// The jittered value never exceeds `max_delay * (1 + jitter)` and never
/// drops below zero.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    // Maps random [0,1) to [-jitter, +jitter]
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}
