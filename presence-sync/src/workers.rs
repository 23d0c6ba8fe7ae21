use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Fixed-size pool for store writes triggered on the connection path.
///
/// `submit` never waits: the task is spawned at once and queues on the pool's
/// permits. Tasks still waiting or running when the pool is force-cancelled
/// resolve to `None`.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn submit<Fut>(&self, name: &'static str, task: Fut) -> JoinHandle<Option<Fut::Output>>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        let token = self.token.clone();
        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            }?;
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!(task = name, "worker task cancelled");
                    None
                }
                output = task => Some(output),
            }
        })
    }

    /// Wait up to `grace` for submitted tasks, then cancel the rest. Later
    /// submissions resolve to `None` at once. Returns whether everything
    /// finished within the grace period.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!(
                pending = self.tracker.len(),
                grace_secs = grace.as_secs(),
                "worker pool did not drain in time, cancelling remaining tasks"
            );
        }
        self.token.cancel();
        self.tracker.wait().await;
        drained
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}
