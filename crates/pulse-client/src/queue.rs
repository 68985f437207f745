//! Outgoing batching and type-keyed throttling.
//!
//! Batching decides *when* events leave; throttling decides whether an event
//! of a given type may leave at all. With batching off, throttling is
//! applied at enqueue. With batching on, it is applied per event at flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use pulse_core::{Event, EventType, WireMessage};
use pulse_settings::BatchingSettings;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where flushed messages go.
pub trait EventSink: Send + Sync {
    /// Transmit one message. `false` means delivery was deferred.
    fn send_message(&self, message: &WireMessage) -> bool;
}

/// What happened to an enqueued event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Sent straight to the sink (batching off).
    Sent,
    /// Added to the buffer; a timer or a later event will flush it.
    Buffered,
    /// Filled the buffer and triggered a flush.
    Flushed,
    /// Dropped by the throttle.
    Throttled,
}

/// Partial queue configuration; `None` fields keep their current value.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfigUpdate {
    /// New `enableBatching`.
    pub enable_batching: Option<bool>,
    /// New `batchSize`.
    pub batch_size: Option<usize>,
    /// New `batchTimeoutMs`.
    pub batch_timeout_ms: Option<u64>,
    /// New `enableThrottling`.
    pub enable_throttling: Option<bool>,
    /// New `throttleIntervalMs`.
    pub throttle_interval_ms: Option<u64>,
}

impl QueueConfigUpdate {
    fn apply(&self, config: &mut BatchingSettings) {
        if let Some(v) = self.enable_batching {
            config.enable_batching = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v.max(1);
        }
        if let Some(v) = self.batch_timeout_ms {
            config.batch_timeout_ms = v;
        }
        if let Some(v) = self.enable_throttling {
            config.enable_throttling = v;
        }
        if let Some(v) = self.throttle_interval_ms {
            config.throttle_interval_ms = v;
        }
    }
}

/// Batching/throttling queue in front of an [`EventSink`].
///
/// Cheap to clone; clones share the buffer.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sink: Arc<dyn EventSink>,
    /// Runtime the queue was built on; flush timers run here when the
    /// caller's thread has none.
    runtime: Option<Handle>,
    state: Mutex<QueueState>,
}

struct QueueState {
    config: BatchingSettings,
    buffer: Vec<Event>,
    timer: Option<CancellationToken>,
    last_sent: HashMap<EventType, Instant>,
}

impl QueueState {
    /// Throttle check. Records the send time when admitted.
    fn admit(&mut self, event_type: EventType, now: Instant) -> bool {
        if !self.config.enable_throttling {
            return true;
        }
        let interval = Duration::from_millis(self.config.throttle_interval_ms);
        if let Some(last) = self.last_sent.get(&event_type) {
            if now.saturating_duration_since(*last) < interval {
                counter!("events_throttled_total", "type" => event_type.as_str()).increment(1);
                return false;
            }
        }
        let _ = self.last_sent.insert(event_type, now);
        true
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl BatchQueue {
    /// Queue sending to `sink`. Captures the current Tokio runtime, if any,
    /// for flush timers.
    pub fn new(config: BatchingSettings, sink: Arc<dyn EventSink>) -> Self {
        Self::with_runtime(config, sink, Handle::try_current().ok())
    }

    /// Queue whose flush timers run on `runtime`.
    pub fn with_runtime(
        config: BatchingSettings,
        sink: Arc<dyn EventSink>,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                sink,
                runtime,
                state: Mutex::new(QueueState {
                    config,
                    buffer: Vec::new(),
                    timer: None,
                    last_sent: HashMap::new(),
                }),
            }),
        }
    }

    /// Accept one event. Safe to call from any thread.
    ///
    /// The flush timer runs on the runtime captured at construction, or on
    /// the caller's. With neither available the buffer is flushed at once.
    pub fn enqueue(&self, event: Event) -> EnqueueOutcome {
        let mut state = self.inner.state.lock();

        if !state.config.enable_batching {
            if !state.admit(event.event_type(), Instant::now()) {
                debug!(event_type = %event.event_type(), "throttled");
                return EnqueueOutcome::Throttled;
            }
            let _ = self.inner.sink.send_message(&WireMessage::from_event(&event));
            return EnqueueOutcome::Sent;
        }

        state.buffer.push(event);
        if state.buffer.len() >= state.config.batch_size {
            self.flush_locked(&mut state);
            return EnqueueOutcome::Flushed;
        }
        if state.timer.is_none() {
            let runtime = self
                .inner
                .runtime
                .clone()
                .or_else(|| Handle::try_current().ok());
            let Some(runtime) = runtime else {
                debug!("no runtime for batch timer, flushing now");
                self.flush_locked(&mut state);
                return EnqueueOutcome::Flushed;
            };
            let token = CancellationToken::new();
            state.timer = Some(token.clone());
            let delay = Duration::from_millis(state.config.batch_timeout_ms);
            let queue = self.clone();
            let _ = runtime.spawn(async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(delay) => {
                        debug!("batch timeout");
                        queue.flush();
                    }
                }
            });
        }
        EnqueueOutcome::Buffered
    }

    /// Send whatever is buffered now and cancel the pending timer.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        self.flush_locked(&mut state);
    }

    /// Drop buffered events and cancel the timer without sending.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.cancel_timer();
        state.buffer.clear();
    }

    /// Merge new options. Buffered events are kept; if the new options make
    /// the buffer due (batching turned off, or size reached) it is flushed.
    pub fn update_config(&self, update: &QueueConfigUpdate) {
        let mut state = self.inner.state.lock();
        update.apply(&mut state.config);
        debug!(config = ?state.config, "queue config updated");
        if !state.buffer.is_empty()
            && (!state.config.enable_batching || state.buffer.len() >= state.config.batch_size)
        {
            self.flush_locked(&mut state);
        }
    }

    /// Current options.
    pub fn config(&self) -> BatchingSettings {
        self.inner.state.lock().config.clone()
    }

    /// Buffered event count.
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    // The sink is called with the queue lock held so concurrent flushes
    // cannot reorder sends. The sink never calls back into the queue.
    fn flush_locked(&self, state: &mut QueueState) {
        state.cancel_timer();
        let mut events = std::mem::take(&mut state.buffer);
        if events.is_empty() {
            return;
        }
        if state.config.enable_throttling {
            let now = Instant::now();
            let before = events.len();
            events.retain(|e| state.admit(e.event_type(), now));
            if events.len() < before {
                debug!(dropped = before - events.len(), "throttled at flush");
            }
        }

        let message = match events.as_slice() {
            [] => return,
            [single] => WireMessage::from_event(single),
            many => WireMessage::batch(many),
        };
        debug!(count = events.len(), "flushing");
        let _ = self.inner.sink.send_message(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<WireMessage>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<WireMessage> {
            self.sent.lock().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn send_message(&self, message: &WireMessage) -> bool {
            self.sent.lock().push(message.clone());
            true
        }
    }

    fn console(msg: &str) -> Event {
        Event::new(EventType::ConsoleLog, json!({"level": "log", "message": msg}))
    }

    fn queue(config: BatchingSettings) -> (BatchQueue, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (BatchQueue::new(config, sink.clone()), sink)
    }

    fn batching(size: usize, timeout_ms: u64) -> BatchingSettings {
        BatchingSettings {
            enable_batching: true,
            batch_size: size,
            batch_timeout_ms: timeout_ms,
            ..BatchingSettings::default()
        }
    }

    fn unbatched_throttle(interval_ms: u64) -> BatchingSettings {
        BatchingSettings {
            enable_batching: false,
            enable_throttling: true,
            throttle_interval_ms: interval_ms,
            ..BatchingSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_flushes_one_batch() {
        let (q, sink) = queue(batching(3, 1000));
        assert_eq!(q.enqueue(console("a")), EnqueueOutcome::Buffered);
        assert_eq!(q.enqueue(console("b")), EnqueueOutcome::Buffered);
        assert_eq!(q.enqueue(console("c")), EnqueueOutcome::Flushed);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Some(EventType::Batch));
        assert_eq!(sent[0].payload["count"], 3);
        assert_eq!(sent[0].payload["events"][2]["payload"]["message"], "c");
        assert_eq!(q.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_event_flushes_unwrapped_after_timeout() {
        let (q, sink) = queue(batching(10, 1000));
        let _ = q.enqueue(console("only"));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(sink.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Some(EventType::ConsoleLog));
        assert_eq!(sent[0].payload["message"], "only");
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_cancels_timer() {
        let (q, sink) = queue(batching(2, 1000));
        let _ = q.enqueue(console("a"));
        let _ = q.enqueue(console("b"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_starts_once_per_buffer() {
        let (q, sink) = queue(batching(10, 1000));
        let _ = q.enqueue(console("a"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        let _ = q.enqueue(console("b"));
        tokio::time::sleep(Duration::from_millis(401)).await;
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload["count"], 2);
    }

    #[tokio::test]
    async fn batching_disabled_sends_immediately() {
        let (q, sink) = queue(BatchingSettings {
            enable_batching: false,
            ..BatchingSettings::default()
        });
        assert_eq!(q.enqueue(console("hi")), EnqueueOutcome::Sent);
        assert_eq!(sink.sent()[0].payload["message"], "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_drops_same_type_within_interval() {
        let (q, sink) = queue(unbatched_throttle(100));
        assert_eq!(q.enqueue(console("1")), EnqueueOutcome::Sent);
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(q.enqueue(console("2")), EnqueueOutcome::Throttled);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_admits_after_interval() {
        let (q, sink) = queue(unbatched_throttle(100));
        let _ = q.enqueue(console("1"));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(q.enqueue(console("2")), EnqueueOutcome::Sent);
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_is_per_type() {
        let (q, sink) = queue(unbatched_throttle(100));
        let _ = q.enqueue(console("1"));
        let net = Event::new(EventType::NetworkRequest, json!({"url": "/x"}));
        assert_eq!(q.enqueue(net), EnqueueOutcome::Sent);
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_applies_per_event_at_flush() {
        let (q, sink) = queue(BatchingSettings {
            enable_batching: true,
            batch_size: 3,
            enable_throttling: true,
            throttle_interval_ms: 100,
            ..BatchingSettings::default()
        });
        let _ = q.enqueue(console("a"));
        let _ = q.enqueue(Event::new(EventType::Error, json!({"message": "e"})));
        let _ = q.enqueue(console("b"));

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload["count"], 2);
        assert_eq!(sent[0].payload["events"][0]["payload"]["message"], "a");
        assert_eq!(sent[0].payload["events"][1]["type"], "error");
    }

    #[tokio::test(start_paused = true)]
    async fn update_config_keeps_buffer() {
        let (q, sink) = queue(batching(10, 1000));
        let _ = q.enqueue(console("a"));
        let _ = q.enqueue(console("b"));

        q.update_config(&QueueConfigUpdate {
            batch_timeout_ms: Some(5000),
            ..QueueConfigUpdate::default()
        });
        assert_eq!(q.buffered(), 2);
        assert_eq!(q.config().batch_timeout_ms, 5000);

        q.update_config(&QueueConfigUpdate {
            batch_size: Some(2),
            ..QueueConfigUpdate::default()
        });
        assert_eq!(q.buffered(), 0);
        assert_eq!(sink.sent()[0].payload["count"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_batching_flushes_buffer() {
        let (q, sink) = queue(batching(10, 1000));
        let _ = q.enqueue(console("a"));
        q.update_config(&QueueConfigUpdate {
            enable_batching: Some(false),
            ..QueueConfigUpdate::default()
        });
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(q.enqueue(console("b")), EnqueueOutcome::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_without_sending() {
        let (q, sink) = queue(batching(10, 1000));
        let _ = q.enqueue(console("a"));
        q.clear();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn enqueue_without_runtime_flushes_immediately() {
        let (q, sink) = queue(batching(10, 1000));
        assert_eq!(q.enqueue(console("plain thread")), EnqueueOutcome::Flushed);
        assert_eq!(sink.sent()[0].payload["message"], "plain thread");
        assert_eq!(q.buffered(), 0);
    }

    #[test]
    fn timer_runs_on_captured_runtime_for_foreign_threads() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let q = BatchQueue::with_runtime(batching(10, 20), sink.clone(), Some(rt.handle().clone()));

        let worker = q.clone();
        let outcome = std::thread::spawn(move || worker.enqueue(console("from thread")))
            .join()
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Buffered);

        rt.block_on(async { tokio::time::sleep(Duration::from_millis(200)).await });
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload["message"], "from thread");
    }

    #[test]
    fn config_update_from_json() {
        let update: QueueConfigUpdate =
            serde_json::from_str(r#"{"batchSize": 0, "enableThrottling": true}"#).unwrap();
        let mut config = BatchingSettings::default();
        update.apply(&mut config);
        assert_eq!(config.batch_size, 1);
        assert!(config.enable_throttling);
        assert!(config.enable_batching);
    }
}
