//! Intake-facing dispatch service.
//!
//! Any transport that can produce a valid job record (HTTP handler, gRPC
//! service, cron task) submits through here. The service validates the
//! request, routes future-dated jobs to the scheduled set and everything
//! else straight into its priority stream.

use crate::broker::{BrokerClient, EnqueueOutcome, StatsSnapshot};
use crate::error::DispatchResult;
use crate::models::{EmailJob, Priority, ProviderKind};
use crate::retry::DeadLetterEntry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Service for submitting email jobs and inspecting the system.
pub struct DispatchService {
    broker: Arc<BrokerClient>,
}

impl DispatchService {
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        Self { broker }
    }

    /// Submit an email send request.
    ///
    /// Returns the job id for tracking. A duplicate enqueue inside the dedup
    /// window is treated as success: the job is already on its way.
    pub async fn send_email(
        &self,
        recipients: Vec<String>,
        template: impl Into<String>,
        data: serde_json::Value,
        priority: Priority,
        provider: ProviderKind,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> DispatchResult<Uuid> {
        let mut job = EmailJob::new(recipients, template, data, priority, provider)?;

        if let Some(at) = scheduled_at {
            if at > Utc::now() {
                job.scheduled_at = Some(at);
                self.broker.schedule(&job).await?;

                info!(
                    job_id = %job.job_id(),
                    scheduled_at = %at,
                    priority = %priority,
                    "Email scheduled"
                );
                return Ok(job.id);
            }
            // A past schedule time means "send now".
        }

        match self.broker.enqueue(&job).await? {
            EnqueueOutcome::Queued(stream_id) => {
                info!(
                    job_id = %job.job_id(),
                    stream_id = %stream_id,
                    priority = %priority,
                    recipients = job.recipients.len(),
                    "Email queued"
                );
            }
            EnqueueOutcome::Duplicate => {
                debug!(job_id = %job.job_id(), "Duplicate enqueue, treating as success");
            }
        }

        Ok(job.id)
    }

    /// System-wide statistics snapshot.
    pub async fn stats(&self) -> DispatchResult<StatsSnapshot> {
        self.broker.stats().await
    }

    /// Most recent dead-letter entries for operator inspection.
    pub async fn dead_letters(&self, limit: usize) -> DispatchResult<Vec<DeadLetterEntry>> {
        self.broker.dead_letters(limit).await
    }
}
