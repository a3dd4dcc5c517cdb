//! Broadcast cancellation plus a join counter for every spawned task.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Shared by `main`, the dispatcher and (through the dispatcher) every
/// uploader. All tasks observe the same token, so they stop together and
/// drain in parallel; `wait` returns once every tracked task has exited.
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task that `wait` will join.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Cancel every task. Tasks spawned afterwards are still joined.
    pub fn trigger(&self) {
        self.token.cancel();
        self.tracker.close();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Tasks spawned through this coordinator that have not exited yet.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Resolve once `trigger` was called and every tracked task finished.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}
