//! Dispatch Domain
//!
//! Durable, priority-aware email dispatch over Redis Streams.
//!
//! Application services submit send requests; the engine guarantees each
//! accepted request is attempted by exactly one worker, retried with backoff
//! on transient failure, quarantined on permanent failure, and rate-limited
//! per upstream provider.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ DispatchService │  ← Validates and submits jobs
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  Redis Streams  │  ← email:queue:{high|medium|low}
//! └────────┬────────┘       (+ dedup / retry / scheduled / dead letter)
//!          │
//! ┌────────▼────────┐
//! │ DispatchWorker  │  ← breaker → rate limit → render → send → ack
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  EmailProvider  │  ← SendGrid, Mailgun, SMTP
//! └─────────────────┘
//! ```
//!
//! The `DispatchScheduler` runs beside the workers as a single instance,
//! promoting future-dated jobs and due retries back into the live streams.
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_dispatch::{
//!     BrokerClient, DispatchConfig, DispatchService, Priority, ProviderKind,
//! };
//!
//! let broker = Arc::new(BrokerClient::connect(&redis_config, config).await?);
//! let service = DispatchService::new(broker);
//!
//! let job_id = service
//!     .send_email(
//!         vec!["user@example.com".into()],
//!         "password_reset",
//!         serde_json::json!({"reset_link": url}),
//!         Priority::High,
//!         ProviderKind::Sendgrid,
//!         None,
//!     )
//!     .await?;
//! ```

pub mod breaker;
pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod streams;
pub mod templates;
pub mod worker;

// Re-export commonly used types
pub use breaker::{CircuitBreaker, CircuitState};
pub use broker::{BrokerClient, EnqueueOutcome, StatsSnapshot};
pub use config::{BreakerConfig, DispatchConfig, RateLimit};
pub use error::{DispatchError, DispatchResult};
pub use models::{EmailJob, JobStatus, Priority, ProviderKind, MAX_RECIPIENTS};
pub use providers::{
    EmailContent, EmailProvider, MailgunConfig, MailgunProvider, SendError, SendGridConfig,
    SendGridProvider, SentEmail, SmtpConfig, SmtpProvider,
};
pub use retry::DeadLetterEntry;
pub use scheduler::DispatchScheduler;
pub use service::DispatchService;
pub use templates::{RenderedEmail, TemplateEngine};
pub use worker::DispatchWorker;
