//! Time-windowed suppression of re-emitted Redux actions.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use pulse_core::{Event, EventId};
use serde_json::Value;
use tokio::time::Instant;

/// Default window in which a repeated action is considered a duplicate.
pub const DEFAULT_TTL: Duration = Duration::from_millis(5000);

/// Bounded cache of recently accepted dedup keys.
///
/// Only types for which [`EventType::participates_in_dedup`] holds are
/// inspected. Expired entries are swept on every check, oldest first, so
/// the sweep is amortized O(1) and no timer is needed.
///
/// [`EventType::participates_in_dedup`]: pulse_core::EventType::participates_in_dedup
#[derive(Debug)]
pub struct DuplicateSuppressor {
    ttl: Duration,
    seen: HashMap<String, EventId>,
    order: VecDeque<(Instant, String)>,
}

impl DuplicateSuppressor {
    /// Suppressor with the given window.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Whether `event` repeats one accepted within the window.
    ///
    /// A first sighting is recorded and returns `false`. A repeat returns
    /// `true` and leaves the original entry (and its expiry) untouched.
    pub fn should_suppress(&mut self, event: &Event) -> bool {
        self.should_suppress_at(event, Instant::now())
    }

    /// [`should_suppress`](Self::should_suppress) with an explicit clock.
    pub fn should_suppress_at(&mut self, event: &Event, now: Instant) -> bool {
        if !event.event_type().participates_in_dedup() {
            return false;
        }
        self.purge(now);

        let key = dedup_key(event);
        if let Some(original) = self.seen.get(&key) {
            tracing::debug!(key, original = %original, "suppressing duplicate action");
            return true;
        }
        let _ = self.seen.insert(key.clone(), event.id().clone());
        self.order.push_back((now, key));
        false
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    fn purge(&mut self, now: Instant) {
        while let Some((inserted, _)) = self.order.front() {
            if now.saturating_duration_since(*inserted) < self.ttl {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                let _ = self.seen.remove(&key);
            }
        }
    }
}

impl Default for DuplicateSuppressor {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// `actionType-actionTimestamp`.
///
/// The action type is read from `payload.action.type`, then
/// `payload.actionType`, then `payload.type`. The action timestamp comes from
/// `payload.timestamp` or `payload.action.timestamp`, falling back to the
/// event's own timestamp.
pub fn dedup_key(event: &Event) -> String {
    let payload = event.payload();
    let action = payload.get("action");

    let action_type = action
        .and_then(|a| a.get("type"))
        .or_else(|| payload.get("actionType"))
        .or_else(|| payload.get("type"))
        .map_or_else(String::new, scalar_text);

    let action_ts = payload
        .get("timestamp")
        .or_else(|| action.and_then(|a| a.get("timestamp")))
        .filter(|v| !v.is_null())
        .map_or_else(|| event.timestamp().to_string(), scalar_text);

    format!("{action_type}-{action_ts}")
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
