use crate::errors::{AppError, AppResult};
use crate::outcomes::OutcomeTracker;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Runs the stale-outcome sweep on an interval and whenever triggered.
#[derive(Clone)]
pub struct OutcomeSweeper {
    tracker: OutcomeTracker,
    interval: Duration,
    wake: Arc<Notify>,
    stop: Arc<Notify>,
}

impl OutcomeSweeper {
    pub fn new(tracker: OutcomeTracker, interval: Duration) -> Self {
        Self {
            tracker,
            interval,
            wake: Arc::new(Notify::new()),
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move {
            sweeper.run_loop().await;
        })
    }

    /// Requests an immediate sweep from the running loop.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        self.stop.notify_one();
    }

    async fn run_loop(self) {
        tracing::info!(interval_sec = self.interval.as_secs(), "outcome sweeper started");
        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => {}
            }
            if let Err(error) = self.sweep_now().await {
                tracing::warn!(error = %error, "outcome sweep failed");
            }
        }
        tracing::info!("outcome sweeper stopped");
    }

    /// One sweep on the blocking pool. Returns the number of outcomes updated.
    pub async fn sweep_now(&self) -> AppResult<usize> {
        let tracker = self.tracker.clone();
        tokio::task::spawn_blocking(move || tracker.sweep_stale())
            .await
            .map_err(|err| AppError::Internal(format!("sweep task failed: {}", err)))?
    }
}
