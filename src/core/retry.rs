// src/core/retry.rs — Caller-side retry policy for experiment execution
//
// The coordinator never retries on its own. The cycle engine hands this
// policy to the batch driver, which decides per failure whether another
// attempt is allowed and how long to back off first.
// Retries: runner unavailable, timeouts, internal errors (opt-out).
// Never retries: rejected configurations, cancellations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::FailureKind;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_DELAY_MS: u64 = 1_000;
const BACKOFF_FACTOR: f64 = 2.0;
const MAX_DELAY_MS: u64 = 30_000;
const JITTER_FRACTION: f64 = 0.2;

/// Attempts and backoff applied to one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
    /// Internal runner errors may leave partial state behind on the runner;
    /// set to false to surface them after the first attempt.
    pub retry_internal_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_delay_ms: INITIAL_DELAY_MS,
            backoff_factor: BACKOFF_FACTOR,
            max_delay_ms: MAX_DELAY_MS,
            jitter_fraction: JITTER_FRACTION,
            retry_internal_errors: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that surfaces every failure immediately.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failure of `kind` on attempt `attempt` (1-based) gets another try.
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match kind {
            FailureKind::RunnerUnavailable | FailureKind::Timeout => true,
            FailureKind::RunnerInternalError => self.retry_internal_errors,
            FailureKind::RunnerRejected | FailureKind::InvalidOutput | FailureKind::Cancelled => {
                false
            }
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay_ms as f64);

        let jitter = deterministic_jitter(attempt, self.jitter_fraction);
        Duration::from_millis((capped_ms * jitter).max(0.0) as u64)
    }
}

/// Deterministic jitter for a given attempt to keep retries reproducible in tests.
/// Returns a multiplier in [1 - fraction, 1 + fraction].
fn deterministic_jitter(attempt: u32, fraction: f64) -> f64 {
    let hash = (attempt.wrapping_mul(2654435761)) as f64 / u32::MAX as f64;
    1.0 + fraction * (2.0 * hash - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_transient_failures() {
        let p = RetryPolicy::default();
        assert!(p.should_retry(FailureKind::RunnerUnavailable, 1));
        assert!(p.should_retry(FailureKind::Timeout, 2));
        assert!(p.should_retry(FailureKind::RunnerInternalError, 1));
    }

    #[test]
    fn test_never_retry_rejected_or_cancelled() {
        let p = RetryPolicy::default();
        assert!(!p.should_retry(FailureKind::RunnerRejected, 1));
        assert!(!p.should_retry(FailureKind::Cancelled, 1));
    }

    #[test]
    fn test_attempt_cap() {
        let p = RetryPolicy::default();
        assert!(!p.should_retry(FailureKind::Timeout, 3));
        assert!(!RetryPolicy::none().should_retry(FailureKind::Timeout, 1));
    }

    #[test]
    fn test_internal_errors_opt_out() {
        let p = RetryPolicy {
            retry_internal_errors: false,
            ..Default::default()
        };
        assert!(!p.should_retry(FailureKind::RunnerInternalError, 1));
    }

    #[test]
    fn test_delay_for_attempt_exponential() {
        let p = RetryPolicy::default();
        let d0 = p.delay_for_attempt(0);
        let d1 = p.delay_for_attempt(1);
        let d2 = p.delay_for_attempt(2);

        // d0 ≈ 1000ms, d1 ≈ 2000ms, d2 ≈ 4000ms
        assert!(d0.as_millis() >= 800 && d0.as_millis() <= 1200);
        assert!(d1.as_millis() >= 1600 && d1.as_millis() <= 2400);
        assert!(d2.as_millis() >= 3200 && d2.as_millis() <= 4800);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let p = RetryPolicy::default();
        let d = p.delay_for_attempt(20);
        assert!(d.as_millis() <= 36_000);
    }

    #[test]
    fn test_zero_delay_policy() {
        let p = RetryPolicy {
            initial_delay_ms: 0,
            ..Default::default()
        };
        assert_eq!(p.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_deterministic_jitter_range() {
        for attempt in 0..20 {
            let j = deterministic_jitter(attempt, 0.2);
            assert!(
                (0.8..=1.2).contains(&j),
                "jitter {} out of range for attempt {}",
                j,
                attempt
            );
        }
    }

    #[test]
    fn test_default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.initial_delay_ms, 1000);
        assert_eq!(p.backoff_factor, 2.0);
        assert_eq!(p.max_delay_ms, 30_000);
        assert!(p.retry_internal_errors);
    }
}
