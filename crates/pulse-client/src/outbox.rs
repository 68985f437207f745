//! Bounded FIFO of serialized messages held while the socket is down.

use std::collections::VecDeque;

use metrics::counter;
use tracing::warn;

/// Default capacity.
pub const DEFAULT_MAX_PENDING: usize = 1000;

/// Messages queued while disconnected, flushed in order on the next open.
///
/// When full, the oldest message is dropped so the most recent application
/// state stays visible once the link returns.
#[derive(Debug)]
pub struct PendingQueue {
    queue: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl PendingQueue {
    /// Queue holding at most `capacity` messages (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a message, evicting the oldest when at capacity.
    pub fn push(&mut self, message: String) {
        while self.queue.len() >= self.capacity {
            if self.queue.pop_front().is_none() {
                break;
            }
            self.dropped += 1;
            counter!("pending_dropped_total").increment(1);
            if self.dropped == 1 || self.dropped.is_power_of_two() {
                warn!(
                    capacity = self.capacity,
                    dropped_total = self.dropped,
                    "pending queue full, dropping oldest message"
                );
            }
        }
        self.queue.push_back(message);
    }

    /// Remove and return everything in FIFO order.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).collect()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Messages evicted over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
