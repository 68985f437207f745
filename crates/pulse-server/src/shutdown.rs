//! Graceful shutdown via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default bound on how long shutdown waits for tasks.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// One token observed by the accept loop and every socket loop.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Fresh, not-yet-cancelled coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a task to watch.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then wait up to `timeout` for `handles`. Tasks still running
    /// after that are aborted. Returns `true` if every task finished in
    /// time.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        info!(tasks = handles.len(), timeout_ms = timeout.as_millis(), "shutting down");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok();
        if !drained {
            warn!(?timeout, "shutdown timed out, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
        drained
    }
}
