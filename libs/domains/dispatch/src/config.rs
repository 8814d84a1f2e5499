//! Dispatch engine configuration.

use crate::models::ProviderKind;
use core_config::{env_parse_or_default, ConfigError};
use std::collections::HashMap;

/// Token bucket parameters for one provider.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Maximum tokens the bucket holds.
    pub bucket_size: u32,
    /// Tokens refilled per minute.
    pub refill_rate: u32,
}

/// Circuit breaker parameters, shared by all per-provider breakers.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before probing.
    pub timeout_secs: u64,
    /// Consecutive half-open successes before the circuit closes.
    pub recovery_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
            recovery_threshold: 3,
        }
    }
}

/// Complete dispatch engine configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-provider token bucket settings.
    pub rate_limits: HashMap<ProviderKind, RateLimit>,
    /// Workers per process.
    pub worker_concurrency: usize,
    /// Jobs read per dequeue.
    pub batch_size: usize,
    /// Failed attempts before a job dead-letters.
    pub retry_attempts: u32,
    /// TTL of dead-letter entries and stored job bodies, in seconds.
    pub dead_letter_ttl_secs: u64,
    /// Scheduler tick interval in seconds.
    pub scheduler_interval_secs: u64,
    /// Dedup window for repeated job ids, in seconds.
    pub dedup_ttl_secs: u64,
    /// Blocking read timeout per priority stream, in milliseconds.
    pub block_timeout_ms: u64,
    /// Worker-side retry poll interval in seconds.
    pub retry_poll_interval_secs: u64,
    /// Pending entries idle longer than this are reclaimed, in seconds.
    pub claim_idle_secs: u64,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let rate_limits = HashMap::from([
            (ProviderKind::Sendgrid, RateLimit { bucket_size: 500, refill_rate: 100 }),
            (ProviderKind::Mailgun, RateLimit { bucket_size: 1000, refill_rate: 200 }),
            (ProviderKind::AwsSes, RateLimit { bucket_size: 200, refill_rate: 50 }),
            (ProviderKind::Smtp, RateLimit { bucket_size: 100, refill_rate: 20 }),
        ]);

        Self {
            rate_limits,
            worker_concurrency: 3,
            batch_size: 50,
            retry_attempts: 3,
            dead_letter_ttl_secs: 86_400 * 7,
            scheduler_interval_secs: 60,
            dedup_ttl_secs: 3600,
            block_timeout_ms: 100,
            retry_poll_interval_secs: 30,
            claim_idle_secs: 300,
            breaker: BreakerConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            worker_concurrency: env_parse_or_default(
                "WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            batch_size: env_parse_or_default("BATCH_SIZE", defaults.batch_size)?,
            retry_attempts: env_parse_or_default("RETRY_ATTEMPTS", defaults.retry_attempts)?,
            dead_letter_ttl_secs: env_parse_or_default(
                "DEAD_LETTER_TTL",
                defaults.dead_letter_ttl_secs,
            )?,
            scheduler_interval_secs: env_parse_or_default(
                "SCHEDULER_INTERVAL",
                defaults.scheduler_interval_secs,
            )?,
            claim_idle_secs: env_parse_or_default("CLAIM_IDLE_SECS", defaults.claim_idle_secs)?,
            breaker: BreakerConfig {
                failure_threshold: env_parse_or_default(
                    "BREAKER_FAILURE_THRESHOLD",
                    defaults.breaker.failure_threshold,
                )?,
                timeout_secs: env_parse_or_default(
                    "BREAKER_TIMEOUT",
                    defaults.breaker.timeout_secs,
                )?,
                recovery_threshold: env_parse_or_default(
                    "BREAKER_RECOVERY_THRESHOLD",
                    defaults.breaker.recovery_threshold,
                )?,
            },
            ..defaults
        })
    }

    /// Rate limit for a provider. Unconfigured providers get a conservative
    /// default bucket.
    pub fn rate_limit(&self, provider: ProviderKind) -> RateLimit {
        self.rate_limits
            .get(&provider)
            .copied()
            .unwrap_or(RateLimit { bucket_size: 100, refill_rate: 20 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DispatchConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.dead_letter_ttl_secs, 604_800);
        assert_eq!(config.scheduler_interval_secs, 60);
        assert_eq!(config.block_timeout_ms, 100);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.timeout_secs, 60);
        assert_eq!(config.breaker.recovery_threshold, 3);
    }

    #[test]
    fn test_default_rate_limits() {
        let config = DispatchConfig::default();
        let sendgrid = config.rate_limit(ProviderKind::Sendgrid);
        assert_eq!(sendgrid.bucket_size, 500);
        assert_eq!(sendgrid.refill_rate, 100);

        let smtp = config.rate_limit(ProviderKind::Smtp);
        assert_eq!(smtp.bucket_size, 100);
        assert_eq!(smtp.refill_rate, 20);
    }

    #[test]
    fn test_rate_limit_fallback() {
        let mut config = DispatchConfig::default();
        config.rate_limits.clear();
        let fallback = config.rate_limit(ProviderKind::Mailgun);
        assert_eq!(fallback.bucket_size, 100);
        assert_eq!(fallback.refill_rate, 20);
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                ("WORKER_CONCURRENCY", Some("10")),
                ("BATCH_SIZE", Some("25")),
                ("RETRY_ATTEMPTS", Some("5")),
                ("BREAKER_FAILURE_THRESHOLD", Some("8")),
            ],
            || {
                let config = DispatchConfig::from_env().unwrap();
                assert_eq!(config.worker_concurrency, 10);
                assert_eq!(config.batch_size, 25);
                assert_eq!(config.retry_attempts, 5);
                assert_eq!(config.breaker.failure_threshold, 8);
                // Untouched values keep their defaults.
                assert_eq!(config.scheduler_interval_secs, 60);
            },
        );
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        temp_env::with_var("BATCH_SIZE", Some("lots"), || {
            assert!(DispatchConfig::from_env().is_err());
        });
    }
}
