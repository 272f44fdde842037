//! Exponential-backoff retry policy for flaky downloads.
//!
//! The cache's fetch path retries transient failures with increasing
//! delays plus a small random jitter so that parallel retries do not
//! stampede the same endpoint.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the retry strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on the deterministic part of the delay.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Maximum additional random jitter added to every delay.
    pub max_jitter: Duration,
    /// Per-attempt deadline after which a fetch counts as stalled.
    pub stall_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_jitter: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(15),
        }
    }
}

/// Deterministic backoff delay before retry `attempt` (1-based: the delay
/// slept after the first failure is `delay_for_attempt(1)`).
///
/// Follows `base * multiplier^(attempt-1)`, clamped to
/// [`RetryPolicy::max_delay`].
pub fn delay_for_attempt(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exp = attempt.saturating_sub(1);
    let ms = policy.base_delay.as_millis() as f64 * policy.multiplier.powi(exp as i32);
    Duration::from_millis(ms as u64).min(policy.max_delay)
}

/// Add uniform random jitter in `0..=max_jitter` to a backoff delay.
pub fn with_jitter(delay: Duration, policy: &RetryPolicy) -> Duration {
    if policy.max_jitter.is_zero() {
        return delay;
    }
    let jitter_ms = rand::rng().random_range(0..=policy.max_jitter.as_millis() as u64);
    delay + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_uses_base_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(delay_for_attempt(1, &policy), Duration::from_millis(1000));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(delay_for_attempt(2, &policy), Duration::from_millis(2000));
        assert_eq!(delay_for_attempt(3, &policy), Duration::from_millis(4000));
    }

    #[test]
    fn delay_clamps_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(delay_for_attempt(10, &policy), Duration::from_secs(5));
    }

    #[test]
    fn custom_multiplier() {
        let policy = RetryPolicy {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(delay_for_attempt(3, &policy), Duration::from_millis(9000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = with_jitter(base, &policy);
            assert!(d >= base);
            assert!(d <= base + policy.max_jitter);
        }
    }

    #[test]
    fn zero_jitter_is_identity() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        let base = Duration::from_millis(1000);
        assert_eq!(with_jitter(base, &policy), base);
    }

    #[test]
    fn default_policy_matches_download_tuning() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_jitter, Duration::from_millis(500));
        assert_eq!(policy.stall_timeout, Duration::from_secs(15));
    }
}
