//! The emit façade.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use pulse_core::{Event, EventType};
use pulse_protocol::MessageRegistry;
use pulse_settings::ClientSettings;
use serde_json::Value;
use tokio::sync::watch;
use tracing::trace;

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionStatus};
use crate::dedup::DuplicateSuppressor;
use crate::queue::{BatchQueue, EnqueueOutcome, QueueConfigUpdate};
use crate::transport::{Connector, TungsteniteConnector};

/// Result of [`PulseClient::emit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Passed to the queue.
    Enqueued(EnqueueOutcome),
    /// Dropped as a repeat of a recent Redux action.
    Duplicate,
    /// Dropped because this thread was already inside `emit`.
    Reentrant,
}

/// One upstream: duplicate suppression, batching and the connection.
///
/// Owned by the caller; create as many as needed.
pub struct PulseClient {
    connection: ConnectionManager,
    queue: BatchQueue,
    dedup: Mutex<DuplicateSuppressor>,
}

impl PulseClient {
    /// Client that dials a real WebSocket.
    pub fn new(settings: &ClientSettings) -> Self {
        Self::with_connector(settings, Arc::new(TungsteniteConnector))
    }

    /// Client over a custom connector.
    pub fn with_connector(settings: &ClientSettings, connector: Arc<dyn Connector>) -> Self {
        Self::with_registry(settings, connector, MessageRegistry::new())
    }

    /// Client with extra handlers for server-to-client messages.
    pub fn with_registry(
        settings: &ClientSettings,
        connector: Arc<dyn Connector>,
        registry: MessageRegistry<ConnectionManager>,
    ) -> Self {
        let connection =
            ConnectionManager::with_registry(ConnectionConfig::from(settings), connector, registry);
        let queue = BatchQueue::new(settings.batching.clone(), Arc::new(connection.clone()));
        let dedup = DuplicateSuppressor::new(Duration::from_millis(settings.dedup_ttl_ms));
        Self {
            connection,
            queue,
            dedup: Mutex::new(dedup),
        }
    }

    /// Hand an event to the pipeline.
    ///
    /// Never blocks on the network. Callable from any thread, including
    /// ones outside the runtime the client was built on.
    pub fn emit(&self, event: Event) -> EmitOutcome {
        let Some(_guard) = EmitGuard::enter() else {
            return EmitOutcome::Reentrant;
        };
        if self.dedup.lock().should_suppress(&event) {
            trace!(event_id = %event.id(), "duplicate dropped");
            counter!("events_deduplicated_total").increment(1);
            return EmitOutcome::Duplicate;
        }
        EmitOutcome::Enqueued(self.queue.enqueue(event))
    }

    /// Build and emit an event stamped now.
    pub fn emit_payload(&self, event_type: EventType, payload: Value) -> EmitOutcome {
        self.emit(Event::new(event_type, payload))
    }

    /// Start (or resume) the connection.
    pub fn connect(&self) -> bool {
        self.connection.connect()
    }

    /// Temporary disconnect: buffered events move to the pending queue and
    /// go out after the next `connect()`.
    pub fn disconnect(&self) {
        self.connection.disconnect();
        self.queue.flush();
    }

    /// Full shutdown: everything buffered or pending is discarded.
    pub fn stop(&self) {
        self.queue.clear();
        self.connection.stop();
    }

    /// Send whatever the batch buffer holds now.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Merge new batching/throttling options.
    pub fn update_queue_config(&self, update: &QueueConfigUpdate) {
        self.queue.update_config(update);
    }

    /// Connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Observe connection status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

thread_local! {
    static IN_EMIT: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside `emit` until dropped.
struct EmitGuard;

impl EmitGuard {
    fn enter() -> Option<Self> {
        IN_EMIT.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for EmitGuard {
    fn drop(&mut self) {
        IN_EMIT.with(|flag| flag.set(false));
    }
}
