//! Scheduled-send promotion.
//!
//! A single-instance task, not a worker: each tick moves due scheduled jobs
//! and due retries into the live priority streams. The due-time filter is
//! idempotent, so a crash mid-tick just means a later tick finds the same
//! entries still due.

use crate::broker::BrokerClient;
use crate::error::DispatchResult;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Promotes future-dated jobs and due retries into live queues.
pub struct DispatchScheduler {
    broker: Arc<BrokerClient>,
    interval: Duration,
}

impl DispatchScheduler {
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        let interval = Duration::from_secs(broker.config().scheduler_interval_secs);
        Self { broker, interval }
    }

    /// Run until the shutdown flag flips. A tick error is logged and the
    /// next tick proceeds; the scheduler never crashes over one.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Email scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so jobs
        // scheduled "right now" still wait for a real tick boundary.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        info!("Email scheduler stopped");
    }

    /// One promotion pass: scheduled jobs first, then due retries.
    pub async fn tick(&self) -> DispatchResult<()> {
        let now = Utc::now().timestamp();

        let promoted = self.broker.promote_due_scheduled(now).await?;
        let retried = self.broker.process_due_retries(now).await?;

        if promoted > 0 || retried > 0 {
            info!(
                scheduled = promoted,
                retries = retried,
                "Scheduler tick promoted jobs"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DispatchConfig;

    #[test]
    fn test_interval_comes_from_config() {
        let config = DispatchConfig::default();
        assert_eq!(config.scheduler_interval_secs, 60);
    }
}
