//! Per-binding shutdown: one token to signal, one tracker to wait on.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Signals and awaits every task a binding spawned.
///
/// Accept loops, sessions, request tasks and writers all run on the same
/// tracker, so [`graceful_shutdown`](Self::graceful_shutdown) returns only
/// when the binding has nothing left running (or the timeout hits).
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Clone of the task tracker.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tracked tasks still running.
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Signal shutdown and wait up to `timeout` for every tracked task.
    ///
    /// Returns `true` if everything finished in time. Tasks still running
    /// after the timeout are left to finish on their own.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown();
        let _ = self.tracker.close();
        info!(
            task_count = self.tracker.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "shutdown timed out after {timeout:?}, some tasks may still be running"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.task_count(), 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_propagates() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token().child_token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_awaits_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let _ = coord.spawn(async move { token.cancelled().await });
        assert!(coord.graceful_shutdown(Duration::from_secs(5)).await);
        assert_eq!(coord.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_times_out_on_stuck_task() {
        let coord = ShutdownCoordinator::new();
        let _ = coord.spawn(tokio::time::sleep(Duration::from_secs(300)));
        assert!(!coord.graceful_shutdown(Duration::from_millis(100)).await);
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn tracked_futures_count_toward_wait() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let tracked = coord.tracker().track_future(async move { token.cancelled().await });
        let handle = tokio::spawn(tracked);
        assert_eq!(coord.task_count(), 1);
        assert!(coord.graceful_shutdown(Duration::from_secs(5)).await);
        handle.await.unwrap();
    }
}
