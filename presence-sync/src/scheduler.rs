use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Periodic background tasks sharing one cancellation point.
pub struct Scheduler {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `task` after `initial_delay` and then every `period`. Ticks missed
    /// while a run is still in progress are skipped, not queued.
    pub fn schedule<F, Fut>(&self, name: &'static str, initial_delay: Duration, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => task().await,
                }
            }
            debug!(task = name, "scheduled task stopped");
        });
    }

    /// Stop every scheduled task and wait for runs in progress to finish.
    pub async fn cancel_all(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_runs_periodically_until_cancelled() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.schedule("count", Duration::ZERO, Duration::from_secs(3), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        scheduler.cancel_all().await;
        assert_eq!(scheduler.task_count(), 0);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
