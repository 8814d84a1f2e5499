//! Redis key layout for the dispatch engine.
//!
//! Every piece of cross-worker state lives under one of these keys and is
//! only mutated through the broker client.

use crate::models::{Priority, ProviderKind};

/// Consumer group shared by all dispatch workers, across all priorities.
pub const CONSUMER_GROUP: &str = "email_workers";

/// Set of recently enqueued job ids, used to reject duplicates.
pub const DEDUP_KEY: &str = "email:dedup";

/// Sorted set `job_id -> retry due timestamp`.
pub const RETRY_KEY: &str = "email:retry";

/// Sorted set `job_id -> scheduled send timestamp`.
pub const SCHEDULED_KEY: &str = "email:scheduled";

/// List of dead-lettered job snapshots.
pub const DEAD_LETTER_KEY: &str = "email:dead_letter";

/// Hash of daily sent/failed counters.
pub const STATS_KEY: &str = "email:stats:daily";

/// Priority stream for email jobs, e.g. `email:queue:high`.
pub fn queue_key(priority: Priority) -> String {
    format!("email:queue:{priority}")
}

/// Token bucket hash for a provider, e.g. `rate_limit:sendgrid`.
pub fn rate_limit_key(provider: ProviderKind) -> String {
    format!("rate_limit:{provider}")
}

/// Body of a scheduled or retry-pending job, e.g. `email:job:<uuid>`.
pub fn job_body_key(job_id: &str) -> String {
    format!("email:job:{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys_per_priority() {
        assert_eq!(queue_key(Priority::High), "email:queue:high");
        assert_eq!(queue_key(Priority::Medium), "email:queue:medium");
        assert_eq!(queue_key(Priority::Low), "email:queue:low");
    }

    #[test]
    fn test_provider_and_job_keys() {
        assert_eq!(rate_limit_key(ProviderKind::Sendgrid), "rate_limit:sendgrid");
        assert_eq!(rate_limit_key(ProviderKind::AwsSes), "rate_limit:aws_ses");
        assert_eq!(job_body_key("abc-123"), "email:job:abc-123");
    }
}
