//! Metrics helpers for dispatch observability.
//!
//! Counters and gauges are emitted through the `metrics` facade; the worker
//! binary installs the Prometheus recorder. Exposition is left to the
//! deployment.
//!
//! ## Emitted series
//!
//! - `email_jobs_processed_total` - Counter of jobs by outcome
//! - `email_retries_total` - Counter of retry scheduling by attempt
//! - `email_send_duration_seconds` - Histogram of provider send time
//! - `email_queue_depth` - Gauge of stream length per priority
//! - `email_promotions_dropped_total` - Counter of promotions dropped
//!   because the stored job body had expired

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric names as constants for consistency
pub mod names {
    pub const JOBS_PROCESSED: &str = "email_jobs_processed_total";
    pub const RETRIES: &str = "email_retries_total";
    pub const SEND_DURATION: &str = "email_send_duration_seconds";
    pub const QUEUE_DEPTH: &str = "email_queue_depth";
    pub const PROMOTIONS_DROPPED: &str = "email_promotions_dropped_total";
}

/// Job outcome for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome {
    Sent,
    Failed,
    DeadLettered,
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_letter",
            Self::Skipped => "skipped",
        }
    }
}

/// Record a processed job with its outcome.
pub fn record_job_processed(provider: &str, outcome: JobOutcome) {
    counter!(
        names::JOBS_PROCESSED,
        "provider" => provider.to_string(),
        "outcome" => outcome.as_str().to_string()
    )
    .increment(1);
}

/// Record a retry being scheduled.
pub fn record_retry(provider: &str, attempt: u32) {
    counter!(
        names::RETRIES,
        "provider" => provider.to_string(),
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Record how long a provider send took.
pub fn record_send_duration(provider: &str, duration: Duration) {
    histogram!(
        names::SEND_DURATION,
        "provider" => provider.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the queue depth gauge for one priority stream.
pub fn set_queue_depth(priority: &str, depth: f64) {
    gauge!(
        names::QUEUE_DEPTH,
        "priority" => priority.to_string()
    )
    .set(depth);
}

/// Record a scheduled or retry promotion dropped because its body expired.
pub fn record_promotion_dropped(source: &str) {
    counter!(
        names::PROMOTIONS_DROPPED,
        "source" => source.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_outcome_as_str() {
        assert_eq!(JobOutcome::Sent.as_str(), "sent");
        assert_eq!(JobOutcome::Failed.as_str(), "failed");
        assert_eq!(JobOutcome::DeadLettered.as_str(), "dead_letter");
        assert_eq!(JobOutcome::Skipped.as_str(), "skipped");
    }

    #[test]
    fn test_record_without_recorder_is_noop() {
        // The facade drops everything until a recorder is installed;
        // these must not panic in library tests.
        record_job_processed("smtp", JobOutcome::Sent);
        record_retry("smtp", 1);
        record_send_duration("smtp", Duration::from_millis(5));
        set_queue_depth("high", 3.0);
        record_promotion_dropped("scheduled");
    }
}
