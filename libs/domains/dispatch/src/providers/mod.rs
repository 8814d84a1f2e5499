//! Email provider transports.
//!
//! A provider is a pure transport: rendering, rate limiting and breaker
//! checks all happen in the worker before `send` is called. Each provider
//! classifies its own failures as retriable or permanent, which decides
//! whether the job re-enters the retry path or dead-letters outright.

mod mailgun;
mod sendgrid;
mod smtp;

pub use mailgun::{MailgunConfig, MailgunProvider};
pub use sendgrid::{SendGridConfig, SendGridProvider};
pub use smtp::{SmtpConfig, SmtpProvider};

use crate::models::ProviderKind;
use async_trait::async_trait;
use thiserror::Error;

/// A provider failure, classified for the retry state machine.
#[derive(Debug, Error)]
pub enum SendError {
    /// Transient: timeouts, 5xx, connection trouble, provider-side rate
    /// limiting. The job goes back through the retry path.
    #[error("retriable provider error: {0}")]
    Retriable(String),

    /// Permanent: bad credentials, malformed addresses, rejected payloads.
    /// The job dead-letters without further attempts.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, SendError::Retriable(_))
    }

    /// Classify an HTTP status from a provider API.
    ///
    /// 429 and every 5xx are worth retrying; any other 4xx reflects the
    /// request itself and will not improve.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            429 => SendError::Retriable(format!("rate limited ({status}): {detail}")),
            400..=499 => SendError::Permanent(format!("rejected ({status}): {detail}")),
            _ => SendError::Retriable(format!("upstream error ({status}): {detail}")),
        }
    }
}

/// Rendered email ready for a transport.
#[derive(Debug, Clone, Default)]
pub struct EmailContent {
    /// Recipient addresses.
    pub recipients: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// HTML body content.
    pub html_body: String,
    /// Plain text body content.
    pub text_body: String,
}

/// Represents a sent email with provider-specific message ID.
#[derive(Debug, Clone)]
pub struct SentEmail {
    /// Provider-specific message ID for tracking.
    pub message_id: Option<String>,
    /// Whether the email was accepted for delivery.
    pub accepted: bool,
}

/// Trait for email sending transports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Send an email.
    async fn send(&self, email: &EmailContent) -> Result<SentEmail, SendError>;

    /// Which provider key this transport serves.
    fn kind(&self) -> ProviderKind;

    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Check if the provider is healthy/configured.
    async fn health_check(&self) -> Result<bool, SendError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(SendError::from_status(429, "slow down").is_retriable());
        assert!(SendError::from_status(500, "boom").is_retriable());
        assert!(SendError::from_status(503, "unavailable").is_retriable());

        assert!(!SendError::from_status(401, "bad key").is_retriable());
        assert!(!SendError::from_status(403, "forbidden").is_retriable());
        assert!(!SendError::from_status(400, "malformed address").is_retriable());
    }

    #[test]
    fn test_send_error_display() {
        let err = SendError::Retriable("connection reset".to_string());
        assert_eq!(
            err.to_string(),
            "retriable provider error: connection reset"
        );
    }
}
