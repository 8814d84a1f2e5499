//! SendGrid transport over the v3 HTTP API.

use super::{EmailContent, EmailProvider, SendError, SentEmail};
use crate::error::{DispatchError, DispatchResult};
use crate::models::ProviderKind;
use async_trait::async_trait;
use core_config::{env_or_default, env_required, ConfigError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// SendGrid API configuration.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    /// SendGrid API key.
    pub api_key: String,
    /// Sender email address.
    pub from_email: String,
    /// SendGrid API base URL (defaults to production).
    pub api_url: String,
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>, from_email: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            from_email: from_email.into(),
            api_url: "https://api.sendgrid.com/v3".to_string(),
        }
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: env_required("SENDGRID_API_KEY")?,
            from_email: env_required("SENDGRID_FROM_EMAIL")?,
            api_url: env_or_default("SENDGRID_API_URL", "https://api.sendgrid.com/v3"),
        })
    }
}

/// SendGrid email provider. The HTTP client and its connection pool are
/// owned per worker.
pub struct SendGridProvider {
    config: SendGridConfig,
    client: Client,
}

impl SendGridProvider {
    pub fn new(config: SendGridConfig) -> DispatchResult<Self> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| DispatchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

// SendGrid API request/response structures

#[derive(Debug, Serialize)]
struct SendGridRequest {
    personalizations: Vec<Personalization>,
    from: EmailAddress,
    subject: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Personalization {
    to: Vec<EmailAddress>,
}

#[derive(Debug, Serialize)]
struct EmailAddress {
    email: String,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(rename = "type")]
    content_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SendGridError {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
}

impl SendGridRequest {
    fn build(config: &SendGridConfig, email: &EmailContent) -> Self {
        // One personalization per recipient so template data stays
        // per-recipient on the SendGrid side.
        let personalizations = email
            .recipients
            .iter()
            .map(|addr| Personalization {
                to: vec![EmailAddress {
                    email: addr.clone(),
                }],
            })
            .collect();

        Self {
            personalizations,
            from: EmailAddress {
                email: config.from_email.clone(),
            },
            subject: email.subject.clone(),
            content: vec![
                Content {
                    content_type: "text/plain".to_string(),
                    value: email.text_body.clone(),
                },
                Content {
                    content_type: "text/html".to_string(),
                    value: email.html_body.clone(),
                },
            ],
        }
    }
}

#[async_trait]
impl EmailProvider for SendGridProvider {
    async fn send(&self, email: &EmailContent) -> Result<SentEmail, SendError> {
        let request = SendGridRequest::build(&self.config, email);

        debug!(
            recipients = email.recipients.len(),
            subject = %email.subject,
            "Sending email via SendGrid"
        );

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    SendError::Retriable(format!("SendGrid request failed: {e}"))
                } else {
                    SendError::Retriable(format!("SendGrid transport error: {e}"))
                }
            })?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            info!(
                recipients = email.recipients.len(),
                message_id = ?message_id,
                "Email sent via SendGrid"
            );
            return Ok(SentEmail {
                message_id,
                accepted: true,
            });
        }

        let error_body = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<SendGridError>(&error_body) {
            Ok(sg_error) => sg_error
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join(", "),
            Err(_) => error_body,
        };

        error!(status = %status, error = %detail, "SendGrid rejected the send");
        Err(SendError::from_status(status.as_u16(), detail))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Sendgrid
    }

    fn name(&self) -> &'static str {
        "SendGrid"
    }

    async fn health_check(&self) -> Result<bool, SendError> {
        // No dedicated health endpoint; validate the key format instead.
        if self.config.api_key.starts_with("SG.") {
            Ok(true)
        } else {
            Err(SendError::Permanent(
                "invalid SendGrid API key format".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendgrid_config_new() {
        let config = SendGridConfig::new("SG.test_key", "noreply@example.com");
        assert_eq!(config.api_key, "SG.test_key");
        assert_eq!(config.api_url, "https://api.sendgrid.com/v3");
    }

    #[test]
    fn test_request_one_personalization_per_recipient() {
        let config = SendGridConfig::new("SG.key", "noreply@example.com");
        let email = EmailContent {
            recipients: vec![
                "a@example.com".to_string(),
                "b@example.com".to_string(),
                "c@example.com".to_string(),
            ],
            subject: "hello".to_string(),
            html_body: "<p>hello</p>".to_string(),
            text_body: "hello".to_string(),
        };

        let request = SendGridRequest::build(&config, &email);
        assert_eq!(request.personalizations.len(), 3);
        assert_eq!(request.content.len(), 2);
        assert_eq!(request.from.email, "noreply@example.com");
    }

    #[test]
    fn test_config_from_env_requires_key() {
        temp_env::with_vars(
            [
                ("SENDGRID_API_KEY", None::<&str>),
                ("SENDGRID_FROM_EMAIL", Some("noreply@example.com")),
            ],
            || {
                assert!(SendGridConfig::from_env().is_err());
            },
        );
    }
}
