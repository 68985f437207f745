//! In-memory `metrics` recorder for assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, LocalRecorderGuard,
    Metadata, Recorder, SharedString, Unit,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MetricSlot {
    counter: AtomicU64,
    gauge: Mutex<f64>,
    samples: Mutex<Vec<f64>>,
}

impl CounterFn for MetricSlot {
    fn increment(&self, value: u64) {
        let _ = self.counter.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        let _ = self.counter.fetch_max(value, Ordering::Relaxed);
    }
}

impl GaugeFn for MetricSlot {
    fn increment(&self, value: f64) {
        *lock(&self.gauge) += value;
    }

    fn decrement(&self, value: f64) {
        *lock(&self.gauge) -= value;
    }

    fn set(&self, value: f64) {
        *lock(&self.gauge) = value;
    }
}

impl HistogramFn for MetricSlot {
    fn record(&self, value: f64) {
        lock(&self.samples).push(value);
    }
}

/// Records every counter, gauge and histogram update made while installed.
///
/// Lookups match on the metric name plus any subset of its labels, summing
/// across the label sets that match.
#[derive(Clone, Default)]
pub struct CapturedMetrics {
    slots: Arc<Mutex<HashMap<Key, Arc<MetricSlot>>>>,
}

impl CapturedMetrics {
    /// Route `metrics` macros on the current thread here until the guard
    /// drops.
    pub fn install(&self) -> LocalRecorderGuard<'_> {
        metrics::set_default_local_recorder(self)
    }

    /// Counter total for `name` across label sets containing `labels`.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.matching(name, labels)
            .iter()
            .map(|s| s.counter.load(Ordering::Relaxed))
            .sum()
    }

    /// Gauge value for `name`, summed across label sets.
    pub fn gauge(&self, name: &str) -> f64 {
        self.matching(name, &[]).iter().map(|s| *lock(&s.gauge)).sum()
    }

    /// Samples recorded into histogram `name`.
    pub fn histogram(&self, name: &str) -> Vec<f64> {
        self.matching(name, &[])
            .iter()
            .flat_map(|s| lock(&s.samples).clone())
            .collect()
    }

    fn matching(&self, name: &str, labels: &[(&str, &str)]) -> Vec<Arc<MetricSlot>> {
        lock(&self.slots)
            .iter()
            .filter(|(key, _)| {
                key.name() == name
                    && labels
                        .iter()
                        .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v))
            })
            .map(|(_, slot)| slot.clone())
            .collect()
    }

    fn slot(&self, key: &Key) -> Arc<MetricSlot> {
        lock(&self.slots).entry(key.clone()).or_default().clone()
    }
}

impl Recorder for CapturedMetrics {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.slot(key))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.slot(key))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.slot(key))
    }
}
