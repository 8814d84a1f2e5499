//! Mailgun transport over the v3 messages API.

use super::{EmailContent, EmailProvider, SendError, SentEmail};
use crate::error::{DispatchError, DispatchResult};
use crate::models::ProviderKind;
use async_trait::async_trait;
use core_config::{env_or_default, env_required, ConfigError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailgun API configuration.
#[derive(Debug, Clone)]
pub struct MailgunConfig {
    /// Mailgun API key.
    pub api_key: String,
    /// Sending domain, e.g. `mg.example.com`.
    pub domain: String,
    /// Sender email address.
    pub from_email: String,
    /// API base URL (defaults to the US region).
    pub api_url: String,
}

impl MailgunConfig {
    pub fn new(
        api_key: impl Into<String>,
        domain: impl Into<String>,
        from_email: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            domain: domain.into(),
            from_email: from_email.into(),
            api_url: "https://api.mailgun.net/v3".to_string(),
        }
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: env_required("MAILGUN_API_KEY")?,
            domain: env_required("MAILGUN_DOMAIN")?,
            from_email: env_required("MAILGUN_FROM_EMAIL")?,
            api_url: env_or_default("MAILGUN_API_URL", "https://api.mailgun.net/v3"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MailgunResponse {
    id: Option<String>,
}

/// Mailgun email provider.
pub struct MailgunProvider {
    config: MailgunConfig,
    client: Client,
}

impl MailgunProvider {
    pub fn new(config: MailgunConfig) -> DispatchResult<Self> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| DispatchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn form_params(&self, email: &EmailContent) -> Vec<(&'static str, String)> {
        let mut params = vec![("from", self.config.from_email.clone())];
        for recipient in &email.recipients {
            params.push(("to", recipient.clone()));
        }
        params.push(("subject", email.subject.clone()));
        params.push(("text", email.text_body.clone()));
        params.push(("html", email.html_body.clone()));
        params
    }
}

#[async_trait]
impl EmailProvider for MailgunProvider {
    async fn send(&self, email: &EmailContent) -> Result<SentEmail, SendError> {
        debug!(
            recipients = email.recipients.len(),
            subject = %email.subject,
            domain = %self.config.domain,
            "Sending email via Mailgun"
        );

        let response = self
            .client
            .post(format!(
                "{}/{}/messages",
                self.config.api_url, self.config.domain
            ))
            .basic_auth("api", Some(&self.config.api_key))
            .form(&self.form_params(email))
            .send()
            .await
            .map_err(|e| SendError::Retriable(format!("Mailgun request failed: {e}")))?;

        let status = response.status();

        if status.is_success() {
            let message_id = response
                .json::<MailgunResponse>()
                .await
                .ok()
                .and_then(|r| r.id);

            info!(
                recipients = email.recipients.len(),
                message_id = ?message_id,
                "Email sent via Mailgun"
            );
            return Ok(SentEmail {
                message_id,
                accepted: true,
            });
        }

        let detail = response.text().await.unwrap_or_default();
        error!(status = %status, error = %detail, "Mailgun rejected the send");
        Err(SendError::from_status(status.as_u16(), detail))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mailgun
    }

    fn name(&self) -> &'static str {
        "Mailgun"
    }

    async fn health_check(&self) -> Result<bool, SendError> {
        if self.config.api_key.is_empty() || self.config.domain.is_empty() {
            return Err(SendError::Permanent(
                "Mailgun api_key and domain must be configured".to_string(),
            ));
        }
        Ok(true)
    }
}
