//! Per-provider circuit breaker.
//!
//! Breakers are process-local: each worker keeps its own set, one per
//! provider, so a permit check never costs a broker round-trip. There is no
//! fleet-wide tripping; operators watch the failed counter and DLQ growth
//! instead.
//!
//! ## States
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ timeout elapsed
//!      │                                   v
//!      │   recovery_threshold     ┌─────────────┐
//!      └───── successes ───────── │ HALF-OPEN   │
//!                                 └─────────────┘
//!                                       │
//!                        failure        │
//!                        ───────────────┘
//! ```

use crate::config::BreakerConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// Trial sends are permitted to test recovery.
    HalfOpen,
}

/// Thread-safe circuit breaker. The only lock is over the state word and the
/// failure timestamp; both are taken and released synchronously, never across
/// an await point.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
        }
    }

    /// Get the current state of the circuit breaker.
    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap()
    }

    /// Check whether a send may proceed.
    ///
    /// Returns `true` in closed and half-open states. In the open state the
    /// first permit after the timeout flips the circuit to half-open.
    pub fn permit(&self) -> bool {
        let current_state = *self.state.read().unwrap();

        match current_state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.should_attempt_reset() {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful send.
    pub fn record_success(&self) {
        let current_state = *self.state.read().unwrap();

        match current_state {
            CircuitState::Closed => {
                // Each success pays down one failure, floored at zero.
                let _ = self.failure_count.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |count| Some(count.saturating_sub(1)),
                );
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.recovery_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {
                // Shouldn't happen, but reset anyway
                self.transition_to_closed();
            }
        }
    }

    /// Record a failed send.
    pub fn record_failure(&self) {
        *self.last_failure_time.write().unwrap() = Some(Instant::now());

        let current_state = *self.state.read().unwrap();

        match current_state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                self.transition_to_open();
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }

    /// Current failure count.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    // Internal methods

    fn should_attempt_reset(&self) -> bool {
        let last_failure = self.last_failure_time.read().unwrap();
        match *last_failure {
            Some(time) => time.elapsed() > Duration::from_secs(self.config.timeout_secs),
            None => true,
        }
    }

    fn transition_to_open(&self) {
        let mut state = self.state.write().unwrap();
        *state = CircuitState::Open;
        self.success_count.store(0, Ordering::SeqCst);
        tracing::warn!("Circuit breaker OPENED");
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write().unwrap();
        *state = CircuitState::HalfOpen;
        self.success_count.store(0, Ordering::SeqCst);
        tracing::info!("Circuit breaker HALF-OPEN (testing recovery)");
    }

    fn transition_to_closed(&self) {
        let mut state = self.state.write().unwrap();
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        tracing::info!("Circuit breaker CLOSED (recovered)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, recovery_threshold: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold,
            timeout_secs,
            recovery_threshold,
        })
    }

    #[test]
    fn test_initial_state_closed() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.permit());
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let breaker = breaker(5, 3, 60);

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.permit());
    }

    #[test]
    fn test_closed_success_decrements_failures_floored() {
        let breaker = breaker(5, 3, 60);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.failure_count(), 2);

        breaker.record_success();
        assert_eq!(breaker.failure_count(), 1);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let breaker = breaker(1, 2, 0); // Immediate timeout for testing

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // First permit after the timeout flips to half-open
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.permit());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 3, 0);

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        breaker.permit();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_denies_until_timeout() {
        let breaker = breaker(1, 1, 60);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.permit());
        // Still open, no state churn from repeated denials
        assert!(!breaker.permit());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
