//! Data models for the dispatch domain.

use crate::error::{DispatchError, DispatchResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of recipients allowed on a single job.
pub const MAX_RECIPIENTS: usize = 100;

/// Delivery priority of an email job. Fixed at creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Password resets, 2FA codes.
    High,
    /// Invites, confirmations.
    Medium,
    /// Newsletters, digests.
    Low,
}

impl Priority {
    /// All priorities in drain order. Workers scan HIGH first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream email providers a job can be routed to.
///
/// `AwsSes` is recognised for routing and rate limiting but ships without a
/// bundled transport; jobs addressed to an unconfigured provider fail as
/// retriable and take the retry path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Sendgrid,
    Mailgun,
    AwsSes,
    Smtp,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Sendgrid,
        ProviderKind::Mailgun,
        ProviderKind::AwsSes,
        ProviderKind::Smtp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Sendgrid => "sendgrid",
            ProviderKind::Mailgun => "mailgun",
            ProviderKind::AwsSes => "aws_ses",
            ProviderKind::Smtp => "smtp",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting in a priority stream.
    Pending,
    /// Picked up by a worker, send in progress.
    Sending,
    /// Delivered to the provider. Terminal.
    Sent,
    /// Last attempt failed.
    Failed,
    /// Waiting in the retry set for its due time.
    Retry,
    /// Retries exhausted or failure was permanent. Terminal.
    DeadLetter,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Sending => "sending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::Retry => "retry",
            JobStatus::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

/// An email job, the unit of work flowing through the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailJob {
    /// Unique job identifier, used for deduplication.
    pub id: Uuid,
    /// Recipient addresses. Non-empty, at most [`MAX_RECIPIENTS`].
    pub recipients: Vec<String>,
    /// Template name handed to the renderer.
    pub template: String,
    /// Template variables for rendering.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Delivery priority, fixed at creation.
    pub priority: Priority,
    /// Provider the job is routed to. May be reassigned on failover.
    pub provider: ProviderKind,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Number of failed attempts so far. Monotonically non-decreasing.
    #[serde(default)]
    pub retry_count: u32,
    /// Job creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Future send time, if this is a scheduled job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Broker-assigned stream entry id, populated on dequeue and used for ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl EmailJob {
    /// Create a new pending job, validating the recipient list.
    pub fn new(
        recipients: Vec<String>,
        template: impl Into<String>,
        data: serde_json::Value,
        priority: Priority,
        provider: ProviderKind,
    ) -> DispatchResult<Self> {
        if recipients.is_empty() {
            return Err(DispatchError::InvalidRecipients(
                "at least one recipient is required".to_string(),
            ));
        }
        if recipients.len() > MAX_RECIPIENTS {
            return Err(DispatchError::InvalidRecipients(format!(
                "too many recipients in single job ({} > {MAX_RECIPIENTS})",
                recipients.len()
            )));
        }
        if let Some(bad) = recipients.iter().find(|r| !r.contains('@')) {
            return Err(DispatchError::InvalidRecipients(format!(
                "malformed address: {bad}"
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            recipients,
            template: template.into(),
            data,
            priority,
            provider,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            scheduled_at: None,
            last_error: None,
            stream_id: None,
        })
    }

    /// Job id as a string, the form used in Redis keys and log fields.
    pub fn job_id(&self) -> String {
        self.id.to_string()
    }
}
