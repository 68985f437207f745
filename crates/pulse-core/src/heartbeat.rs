//! Heartbeat ping/pong liveness monitoring.
//!
//! A half-open TCP connection can look open at the socket level while the
//! peer is gone, so both ends probe periodically and give up when a probe
//! goes unanswered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use last_seen::LastSeen;
use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// A ping went unanswered for longer than the timeout.
    TimedOut,
    /// The ping could not be written (socket already gone).
    SendFailed,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Shared liveness flag for one socket.
///
/// The reader side calls [`Liveness::mark_alive`] on every pong (or any
/// inbound activity); the heartbeat loop consumes it.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
    last_seen: LastSeen,
    notify: Notify,
}

impl Liveness {
    /// New flag, initially alive.
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_seen: LastSeen::now(),
            notify: Notify::new(),
        }
    }

    /// Record activity from the peer.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
        self.last_seen.touch();
        self.notify.notify_one();
    }

    /// Whether the peer has been heard from since the last probe.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Time since the last recorded activity.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.elapsed()
    }

    fn arm(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Shortest ping period; a zero interval is raised to this.
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Run heartbeat probes until the peer stops answering or `cancel` fires.
///
/// Every `interval` (when no probe is outstanding) the flag is armed and
/// `send_ping` is called. If the flag is not set again within `timeout`,
/// the loop returns [`HeartbeatResult::TimedOut`].
pub async fn run_heartbeat<F>(
    liveness: &Liveness,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    mut send_ping: F,
) -> HeartbeatResult
where
    F: FnMut() -> bool,
{
    let mut ticker = time::interval(interval.max(MIN_PING_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    let mut deadline: Option<Instant> = None;

    loop {
        let wake_at = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
            () = liveness.notify.notified() => {
                if liveness.is_alive() {
                    deadline = None;
                }
            }
            () = time::sleep_until(wake_at), if deadline.is_some() => {
                if !liveness.is_alive() {
                    return HeartbeatResult::TimedOut;
                }
                deadline = None;
            }
            _ = ticker.tick() => {
                if deadline.is_none() {
                    liveness.arm();
                    if !send_ping() {
                        return HeartbeatResult::SendFailed;
                    }
                    deadline = Some(Instant::now() + timeout);
                }
            }
        }
    }
}

/// Lock-free "last seen" timestamp kept as millis since a fixed origin.
mod last_seen {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    #[derive(Debug)]
    pub(super) struct LastSeen {
        origin: Instant,
        offset_ms: AtomicU64,
    }

    impl LastSeen {
        pub(super) fn now() -> Self {
            Self {
                origin: Instant::now(),
                offset_ms: AtomicU64::new(0),
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        pub(super) fn touch(&self) {
            let ms = self.origin.elapsed().as_millis() as u64;
            self.offset_ms.store(ms, Ordering::Relaxed);
        }

        pub(super) fn elapsed(&self) -> Duration {
            let seen = Duration::from_millis(self.offset_ms.load(Ordering::Relaxed));
            self.origin.elapsed().saturating_sub(seen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn times_out_when_pong_never_arrives() {
        let liveness = Liveness::new();
        let pings = AtomicUsize::new(0);
        let result = run_heartbeat(
            &liveness,
            Duration::from_secs(15),
            Duration::from_secs(5),
            CancellationToken::new(),
            || {
                let _ = pings.fetch_add(1, Ordering::Relaxed);
                true
            },
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(pings.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_connection_alive() {
        let liveness = Arc::new(Liveness::new());
        let cancel = CancellationToken::new();
        let (ping_tx, mut ping_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        let responder = liveness.clone();
        let _responder = tokio::spawn(async move {
            while ping_rx.recv().await.is_some() {
                time::sleep(Duration::from_millis(50)).await;
                responder.mark_alive();
            }
        });

        let hb = liveness.clone();
        let hb_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_heartbeat(
                &hb,
                Duration::from_secs(1),
                Duration::from_millis(500),
                hb_cancel,
                || ping_tx.send(()).is_ok(),
            )
            .await
        });

        time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_send_ends_loop() {
        let liveness = Liveness::new();
        let result = run_heartbeat(
            &liveness,
            Duration::from_secs(1),
            Duration::from_secs(1),
            CancellationToken::new(),
            || false,
        )
        .await;
        assert_eq!(result, HeartbeatResult::SendFailed);
    }

    #[tokio::test]
    async fn cancelled_before_first_tick() {
        let liveness = Liveness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(
            &liveness,
            Duration::from_secs(60),
            Duration::from_secs(5),
            cancel,
            || true,
        )
        .await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_clamped_instead_of_panicking() {
        let liveness = Liveness::new();
        let result = run_heartbeat(
            &liveness,
            Duration::ZERO,
            Duration::from_millis(100),
            CancellationToken::new(),
            || true,
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_alive_resets_last_seen() {
        let liveness = Liveness::new();
        time::advance(Duration::from_secs(3)).await;
        assert!(liveness.last_seen_elapsed() >= Duration::from_secs(3));
        liveness.mark_alive();
        assert!(liveness.last_seen_elapsed() < Duration::from_millis(10));
    }
}
