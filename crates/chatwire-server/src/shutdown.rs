//! Graceful shutdown of the accept loop and connection tasks.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default time to wait for connection tasks to finish.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals shutdown and waits for tracked tasks.
///
/// Every accepted connection runs on a task spawned through
/// [`tracker`](Self::tracker); every long-running loop selects on
/// [`token`](Self::token).
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Fresh coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker for connection tasks.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, stop accepting new tasks, and wait up to `timeout` for
    /// tracked tasks. Returns `false` if the wait timed out.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        let _ = self.tracker.close();
        info!(
            task_count = self.tracker.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for connection tasks"
        );
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(remaining = self.tracker.len(), "shutdown timed out after {timeout:?}");
            false
        } else {
            true
        }
    }
}
