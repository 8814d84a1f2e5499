//! SMTP transport using lettre.
//!
//! Serves production relays as well as local MailHog/Mailpit when TLS is off.
//! Connections are per-send: lettre opens, delivers and closes inside
//! `transport.send`, so a stuck relay cannot pin a pooled connection.

use super::{EmailContent, EmailProvider, SendError, SentEmail};
use crate::error::{DispatchError, DispatchResult};
use crate::models::ProviderKind;
use async_trait::async_trait;
use core_config::env_or_default;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// SMTP configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// SMTP server host.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// Sender email address.
    pub from_email: String,
    /// SMTP username (optional for dev servers like Mailpit).
    pub username: Option<String>,
    /// SMTP password (optional for dev servers like Mailpit).
    pub password: Option<String>,
    /// Whether to use TLS (false for local dev servers).
    pub use_tls: bool,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16, from_email: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            from_email: from_email.into(),
            username: None,
            password: None,
            use_tls: false,
        }
    }

    /// Configuration from SMTP_* environment variables, defaulting to a
    /// local MailHog on 1025.
    pub fn from_env() -> Self {
        Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_or_default("SMTP_PORT", "1025").parse().unwrap_or(1025),
            from_email: env_or_default("SMTP_FROM_EMAIL", "noreply@localhost"),
            username: std::env::var("SMTP_USERNAME").ok().filter(|v| !v.is_empty()),
            password: std::env::var("SMTP_PASSWORD").ok().filter(|v| !v.is_empty()),
            use_tls: std::env::var("SMTP_USE_TLS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }
}

/// SMTP email provider.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    config: Arc<SmtpConfig>,
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig) -> DispatchResult<Self> {
        let transport = Self::build_transport(&config)?;
        Ok(Self {
            transport,
            config: Arc::new(config),
        })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> DispatchResult<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| DispatchError::Provider(format!("Failed to create SMTP relay: {e}")))?
                .port(config.port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port)
        };

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.timeout(Some(SEND_TIMEOUT)).build())
    }

    fn build_message(&self, email: &EmailContent) -> Result<Message, SendError> {
        let from: Mailbox = self
            .config
            .from_email
            .parse()
            .map_err(|e| SendError::Permanent(format!("invalid from address: {e}")))?;

        let mut builder = Message::builder().from(from).subject(&email.subject);

        for recipient in &email.recipients {
            let to: Mailbox = recipient
                .parse()
                .map_err(|e| SendError::Permanent(format!("invalid address '{recipient}': {e}")))?;
            builder = builder.to(to);
        }

        builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text_body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html_body.clone()),
                    ),
            )
            .map_err(|e| SendError::Permanent(format!("failed to build message: {e}")))
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, email: &EmailContent) -> Result<SentEmail, SendError> {
        debug!(
            recipients = email.recipients.len(),
            subject = %email.subject,
            host = %self.config.host,
            port = %self.config.port,
            "Sending email via SMTP"
        );

        let message = self.build_message(email)?;

        let response = self.transport.send(message).await.map_err(|e| {
            error!(error = %e, "SMTP send failed");
            // lettre distinguishes permanent (5xx) from transient (4xx) SMTP
            // responses; everything else (IO, TLS, timeouts) is retriable.
            if e.is_permanent() {
                SendError::Permanent(format!("SMTP send failed: {e}"))
            } else {
                SendError::Retriable(format!("SMTP send failed: {e}"))
            }
        })?;

        let message_id = response.message().next().map(|s| s.to_string());

        info!(
            recipients = email.recipients.len(),
            message_id = ?message_id,
            "Email sent via SMTP"
        );

        Ok(SentEmail {
            message_id,
            accepted: true,
        })
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Smtp
    }

    fn name(&self) -> &'static str {
        "SMTP"
    }

    async fn health_check(&self) -> Result<bool, SendError> {
        self.transport
            .test_connection()
            .await
            .map_err(|e| SendError::Retriable(format!("SMTP health check failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smtp_config_defaults() {
        let config = SmtpConfig::new("mail.example.com", 587, "noreply@example.com");
        assert_eq!(config.host, "mail.example.com");
        assert_eq!(config.port, 587);
        assert!(!config.use_tls);
        assert!(config.username.is_none());
    }

    #[test]
    fn test_smtp_config_builders() {
        let config = SmtpConfig::new("smtp.example.com", 465, "noreply@example.com")
            .with_tls(true)
            .with_credentials("user".to_string(), "pass".to_string());

        assert!(config.use_tls);
        assert_eq!(config.username, Some("user".to_string()));
        assert_eq!(config.password, Some("pass".to_string()));
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let provider = SmtpProvider::new(SmtpConfig::new("localhost", 1025, "noreply@localhost"))
            .unwrap();
        let email = EmailContent {
            recipients: vec!["definitely not an address".to_string()],
            subject: "hi".to_string(),
            html_body: "<p>hi</p>".to_string(),
            text_body: "hi".to_string(),
        };

        let err = provider.build_message(&email).unwrap_err();
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_build_message_multiple_recipients() {
        let provider = SmtpProvider::new(SmtpConfig::new("localhost", 1025, "noreply@localhost"))
            .unwrap();
        let email = EmailContent {
            recipients: vec![
                "a@example.com".to_string(),
                "b@example.com".to_string(),
            ],
            subject: "hi".to_string(),
            html_body: "<p>hi</p>".to_string(),
            text_body: "hi".to_string(),
        };

        assert!(provider.build_message(&email).is_ok());
    }
}
