//! Dispatch worker: drains priority streams and sends email.
//!
//! Each worker runs three concurrent loops:
//! - *main*: dequeue a batch, fan the jobs out as concurrent tasks, join the
//!   whole batch before dequeuing again (bounded backlog)
//! - *retry poller*: promote due retry entries back into the live streams
//! - *stats reporter*: log worker-local throughput once a minute
//!
//! Per-job pipeline: mark SENDING, circuit breaker permit, token bucket
//! check for `recipients.len()` tokens, render (falling back on error),
//! provider send, breaker bookkeeping, ack. A failure in one job never
//! reaches its batch siblings.

use crate::breaker::CircuitBreaker;
use crate::broker::BrokerClient;
use crate::config::DispatchConfig;
use crate::metrics::{self, JobOutcome};
use crate::models::{EmailJob, JobStatus, ProviderKind};
use crate::providers::{EmailContent, EmailProvider, SendError};
use crate::templates::{RenderedEmail, TemplateEngine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Worker-local throughput counters.
pub struct WorkerStats {
    processed: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Jobs per second since the worker started.
    pub fn rate(&self) -> f64 {
        let uptime = self.started_at.elapsed().as_secs_f64();
        self.processed() as f64 / uptime.max(1.0)
    }
}

fn build_breakers(config: &DispatchConfig) -> HashMap<ProviderKind, CircuitBreaker> {
    ProviderKind::ALL
        .into_iter()
        .map(|kind| (kind, CircuitBreaker::new(config.breaker)))
        .collect()
}

/// How a job attempt ended, before the broker transition is applied.
enum SendDisposition {
    Delivered,
    Retriable(String),
    Permanent(String),
}

/// A single dispatch worker. Cheap to clone; all heavy state is shared.
#[derive(Clone)]
pub struct DispatchWorker {
    worker_id: String,
    broker: Arc<BrokerClient>,
    providers: Arc<HashMap<ProviderKind, Arc<dyn EmailProvider>>>,
    // Process-local: a permit check never costs a broker round-trip.
    // One breaker per provider kind.
    breakers: Arc<HashMap<ProviderKind, CircuitBreaker>>,
    templates: Arc<TemplateEngine>,
    config: Arc<DispatchConfig>,
    stats: Arc<WorkerStats>,
}

impl DispatchWorker {
    pub fn new(
        worker_id: impl Into<String>,
        broker: Arc<BrokerClient>,
        providers: Vec<Arc<dyn EmailProvider>>,
        templates: Arc<TemplateEngine>,
        config: Arc<DispatchConfig>,
    ) -> Self {
        let providers: HashMap<ProviderKind, Arc<dyn EmailProvider>> = providers
            .into_iter()
            .map(|p| (p.kind(), p))
            .collect();

        let breakers = build_breakers(&config);

        Self {
            worker_id: worker_id.into(),
            broker,
            providers: Arc::new(providers),
            breakers: Arc::new(breakers),
            templates,
            config,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run the worker until the shutdown flag flips. The in-flight batch
    /// drains before the main loop exits, then the side loops are joined.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            providers = self.providers.len(),
            "Starting dispatch worker"
        );

        if let Err(e) = self.broker.ensure_groups().await {
            warn!(error = %e, "Failed to ensure consumer groups on startup");
        }

        // Adopt whatever this group left pending; workers restart with fresh
        // consumer ids and would otherwise strand entries forever.
        if let Err(e) = self.broker.claim_stale(&self.worker_id, 0).await {
            warn!(error = %e, "Failed to claim pending messages on startup");
        }

        let mut tasks: JoinSet<()> = JoinSet::new();

        let main = self.clone();
        let main_shutdown = shutdown.clone();
        tasks.spawn(async move { main.main_loop(main_shutdown).await });

        let poller = self.clone();
        let poller_shutdown = shutdown.clone();
        tasks.spawn(async move { poller.retry_loop(poller_shutdown).await });

        let reporter = self.clone();
        tasks.spawn(async move { reporter.stats_loop(shutdown).await });

        while tasks.join_next().await.is_some() {}

        info!(worker_id = %self.worker_id, "Dispatch worker stopped");
    }

    /// Main dequeue-and-dispatch loop.
    async fn main_loop(&self, shutdown: watch::Receiver<bool>) {
        let claim_interval = Duration::from_secs(self.config.claim_idle_secs);
        let mut last_claim = Instant::now();

        let mut consecutive_errors: u32 = 0;
        const MAX_BACKOFF_SECS: u64 = 30;

        loop {
            if *shutdown.borrow() {
                info!(worker_id = %self.worker_id, "Received shutdown signal, stopping main loop");
                break;
            }

            match self
                .broker
                .dequeue(&self.worker_id, self.config.batch_size)
                .await
            {
                Ok(jobs) => {
                    if consecutive_errors > 0 {
                        info!("Connection recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                    if jobs.is_empty() {
                        // The blocking reads already waited out their window.
                        continue;
                    }
                    self.process_batch(jobs).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if e.is_connection_error() {
                        let backoff_secs =
                            std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                        warn!(
                            error = %e,
                            consecutive_errors = %consecutive_errors,
                            backoff_secs = %backoff_secs,
                            "Redis connection error, backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    } else {
                        error!(error = %e, "Error reading batch");
                    }

                    // Un-acked entries stay in the pending list and come back
                    // on the next read, so skipping a cycle loses nothing.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }

            if last_claim.elapsed() >= claim_interval {
                let idle_ms = self.config.claim_idle_secs * 1000;
                if let Err(e) = self.broker.claim_stale(&self.worker_id, idle_ms).await {
                    debug!(error = %e, "Error claiming abandoned messages");
                }
                last_claim = Instant::now();
            }
        }
    }

    /// Fan a batch out as concurrent tasks and join them all before
    /// returning. Concurrency is bounded by the batch size.
    async fn process_batch(&self, jobs: Vec<EmailJob>) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        for job in jobs {
            let worker = self.clone();
            tasks.spawn(async move { worker.process_job(job).await });
        }

        while tasks.join_next().await.is_some() {}
    }

    /// Run one job through the send pipeline and apply its broker
    /// transition. Never returns an error: every failure lands in the retry
    /// or dead-letter path.
    async fn process_job(&self, mut job: EmailJob) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        job.status = JobStatus::Sending;

        debug!(
            worker_id = %self.worker_id,
            job_id = %job.job_id(),
            provider = %job.provider,
            retry_count = job.retry_count,
            "Processing email job"
        );

        match self.attempt(&job).await {
            SendDisposition::Delivered => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %job.job_id(), provider = %job.provider, "Email sent");

                if let Err(e) = self.broker.ack(&mut job, true).await {
                    error!(job_id = %job.job_id(), error = %e, "Failed to ack sent job");
                }
            }
            SendDisposition::Retriable(reason) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job.job_id(), error = %reason, "Email attempt failed");

                job.last_error = Some(reason);
                if let Err(e) = self.broker.ack(&mut job, false).await {
                    error!(job_id = %job.job_id(), error = %e, "Failed to ack failed job");
                }
            }
            SendDisposition::Permanent(reason) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job.job_id(), error = %reason, "Permanent send failure");

                if let Err(e) = self.broker.dead_letter(&mut job, &reason).await {
                    error!(job_id = %job.job_id(), error = %e, "Failed to dead-letter job");
                }
            }
        }
    }

    /// The guarded send: breaker, rate limit, render, provider.
    async fn attempt(&self, job: &EmailJob) -> SendDisposition {
        let provider_key = job.provider.as_str();

        let Some(provider) = self.providers.get(&job.provider) else {
            return SendDisposition::Retriable(format!(
                "provider {provider_key} not available"
            ));
        };

        // Breakers exist for every provider kind, so this lookup is total.
        let breaker = &self.breakers[&job.provider];
        if !breaker.permit() {
            metrics::record_job_processed(provider_key, JobOutcome::Skipped);
            return SendDisposition::Retriable(format!(
                "circuit breaker open for {provider_key}"
            ));
        }

        let tokens = job.recipients.len() as u32;
        match self.broker.check_rate(job.provider, tokens).await {
            Ok(true) => {}
            Ok(false) => {
                metrics::record_job_processed(provider_key, JobOutcome::Failed);
                return SendDisposition::Retriable(format!(
                    "rate limit exceeded for {provider_key}"
                ));
            }
            Err(e) => {
                // Broker trouble must not leak into the provider call.
                metrics::record_job_processed(provider_key, JobOutcome::Failed);
                return SendDisposition::Retriable(format!("rate limit check failed: {e}"));
            }
        }

        let rendered = match self.templates.render(&job.template, &job.data) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(
                    job_id = %job.job_id(),
                    template = %job.template,
                    error = %e,
                    "Template rendering failed, using fallback body"
                );
                RenderedEmail::fallback(&job.data)
            }
        };

        let email = EmailContent {
            recipients: job.recipients.clone(),
            subject: rendered.subject,
            html_body: rendered.html,
            text_body: rendered.text,
        };

        let started = Instant::now();
        let result = provider.send(&email).await;
        metrics::record_send_duration(provider_key, started.elapsed());

        match result {
            Ok(_sent) => {
                breaker.record_success();
                metrics::record_job_processed(provider_key, JobOutcome::Sent);
                SendDisposition::Delivered
            }
            Err(SendError::Retriable(reason)) => {
                breaker.record_failure();
                metrics::record_job_processed(provider_key, JobOutcome::Failed);
                SendDisposition::Retriable(reason)
            }
            Err(SendError::Permanent(reason)) => {
                breaker.record_failure();
                SendDisposition::Permanent(reason)
            }
        }
    }

    /// Periodically promote due retry entries.
    async fn retry_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = Duration::from_secs(self.config.retry_poll_interval_secs);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self
                .broker
                .process_due_retries(chrono::Utc::now().timestamp())
                .await
            {
                Ok(_) => poll_interval,
                Err(e) => {
                    error!(error = %e, "Retry processing error");
                    poll_interval * 2
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(worker_id = %self.worker_id, "Retry poller stopped");
    }

    /// Log worker-local counters once a minute and refresh queue gauges.
    async fn stats_loop(&self, mut shutdown: watch::Receiver<bool>) {
        const REPORT_INTERVAL: Duration = Duration::from_secs(60);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = tokio::time::sleep(REPORT_INTERVAL) => {}
            }

            info!(
                worker_id = %self.worker_id,
                processed = self.stats.processed(),
                sent = self.stats.sent(),
                failed = self.stats.failed(),
                rate = format!("{:.2}/sec", self.stats.rate()),
                "Worker stats"
            );

            // stats() refreshes the queue depth gauges as a side effect.
            if let Err(e) = self.broker.stats().await {
                debug!(error = %e, "Failed to read broker stats");
            }
        }

        info!(worker_id = %self.worker_id, "Stats reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockEmailProvider, SentEmail};

    #[test]
    fn test_worker_stats_rate() {
        let stats = WorkerStats::new();
        stats.processed.fetch_add(10, Ordering::Relaxed);
        // Uptime is clamped to at least a second.
        assert!(stats.rate() <= 10.0);
        assert_eq!(stats.processed(), 10);
    }

    #[test]
    fn test_breakers_cover_all_provider_kinds() {
        // A job routed to a provider with no transport must still find a
        // breaker, not a panic.
        let breakers = build_breakers(&DispatchConfig::default());
        for kind in ProviderKind::ALL {
            assert!(breakers.contains_key(&kind));
        }
    }

    #[tokio::test]
    async fn test_mock_provider_send() {
        let mut mock = MockEmailProvider::new();
        mock.expect_send().returning(|_| {
            Ok(SentEmail {
                message_id: Some("m-1".to_string()),
                accepted: true,
            })
        });
        mock.expect_kind().return_const(ProviderKind::Smtp);

        let email = EmailContent {
            recipients: vec!["user@example.com".to_string()],
            subject: "hi".to_string(),
            html_body: String::new(),
            text_body: String::new(),
        };
        let sent = mock.send(&email).await.unwrap();
        assert!(sent.accepted);
        assert_eq!(mock.kind(), ProviderKind::Smtp);
    }
}
