//! Tracked fire-and-forget backfill tasks.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Handle to the set of in-flight backfills. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct Backfills {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Backfills {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the background. Dropped silently once shutdown has begun.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!(backfill = label, "backfill skipped after shutdown");
            return;
        }
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => debug!(backfill = label, "backfill cancelled"),
                () = task => {}
            }
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every backfill spawned so far. New spawns remain allowed.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait up to `grace` for outstanding backfills, then cancel the rest.
    /// Later spawns are ignored.
    pub async fn shutdown(&self, grace: Duration) {
        let pending = self.tracker.len();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!(pending, "backfills drained");
            self.cancel.cancel();
            return;
        }
        warn!(
            remaining = self.tracker.len(),
            grace_ms = grace.as_millis() as u64,
            "cancelling outstanding backfills"
        );
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}
