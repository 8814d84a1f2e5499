//! Retry backoff policy and dead-letter types.
//!
//! A job that fails retriably is parked in the retry set until
//! `now + backoff(retry_count)`; once `retry_count` reaches the configured
//! maximum it dead-letters instead. Dead-letter entries are terminal: there
//! is no automatic replay.

use crate::models::EmailJob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff cap. No retry waits longer than five minutes.
const MAX_BACKOFF_SECS: u64 = 300;

/// Base delay doubled per attempt.
const BASE_BACKOFF_SECS: u64 = 10;

/// Delay before attempt `retry_count + 1`: `min(300, 10 * 2^retry_count)`.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let exp = BASE_BACKOFF_SECS.saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_secs(exp.min(MAX_BACKOFF_SECS))
}

/// A job snapshot parked in the dead-letter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Full job snapshot at the time of the final failure.
    pub job: EmailJob,
    /// Error message that caused the failure.
    pub error: String,
    /// When the job was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: EmailJob, error: impl Into<String>) -> Self {
        Self {
            job,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, ProviderKind};
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_secs(20));
        assert_eq!(backoff_delay(2), Duration::from_secs(40));
        assert_eq!(backoff_delay(3), Duration::from_secs(80));
        assert_eq!(backoff_delay(4), Duration::from_secs(160));
    }

    #[test]
    fn test_backoff_caps_at_five_minutes() {
        assert_eq!(backoff_delay(5), Duration::from_secs(300));
        assert_eq!(backoff_delay(10), Duration::from_secs(300));
        // Exponent overflow must saturate, not panic.
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_dead_letter_entry_roundtrip() {
        let job = EmailJob::new(
            vec!["user@example.com".to_string()],
            "notification",
            json!({"subject": "hi"}),
            Priority::Low,
            ProviderKind::Smtp,
        )
        .unwrap();
        let entry = DeadLetterEntry::new(job.clone(), "SMTP send failed: 554");

        let raw = serde_json::to_string(&entry).unwrap();
        let parsed: DeadLetterEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.job.id, job.id);
        assert_eq!(parsed.error, "SMTP send failed: 554");
    }
}
