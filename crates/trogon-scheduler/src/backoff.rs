use std::time::Duration;

use crate::config::RetryPolicy;

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential delay before jitter: `base * 2^(attempt-1)`, capped.
///
/// `attempt` is the attempt that just failed, starting at 1.
pub fn exponential_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let ms = policy
        .backoff_base_ms
        .saturating_mul(multiplier)
        .min(policy.backoff_cap_ms);
    Duration::from_millis(ms)
}

/// Full jitter: the capped exponential delay scaled by `unit` in `[0, 1]`.
pub fn full_jitter(policy: &RetryPolicy, attempt: u32, unit: f64) -> Duration {
    let ceiling = exponential_delay(policy, attempt);
    if unit.is_nan() {
        return Duration::ZERO;
    }
    ceiling.mul_f64(unit.clamp(0.0, 1.0))
}

/// Retry delay with a fresh random factor, so synchronized failures spread out.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    full_jitter(policy, attempt, rand::random::<f64>())
}

/// Pause between trigger polls after consecutive backend failures.
pub fn poll_backoff(base: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_POLL_BACKOFF.max(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff_base_ms: base_ms,
            backoff_cap_ms: cap_ms,
        }
    }

    #[test]
    fn attempt_1_returns_base() {
        assert_eq!(
            exponential_delay(&policy(1_000, 60_000), 1),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn doubles_per_attempt() {
        let p = policy(1_000, 60_000);
        assert_eq!(exponential_delay(&p, 2), Duration::from_secs(2));
        assert_eq!(exponential_delay(&p, 3), Duration::from_secs(4));
    }

    #[test]
    fn capped() {
        let p = policy(1_000, 5_000);
        assert_eq!(exponential_delay(&p, 4), Duration::from_secs(5));
        assert_eq!(exponential_delay(&p, 200), Duration::from_secs(5));
    }

    #[test]
    fn full_jitter_scales_ceiling() {
        let p = policy(1_000, 60_000);
        assert_eq!(full_jitter(&p, 2, 0.0), Duration::ZERO);
        assert_eq!(full_jitter(&p, 2, 0.5), Duration::from_secs(1));
        assert_eq!(full_jitter(&p, 2, 1.0), Duration::from_secs(2));
        assert_eq!(full_jitter(&p, 2, 7.0), Duration::from_secs(2));
    }

    #[test]
    fn random_retry_delay_never_exceeds_cap() {
        let p = policy(1_000, 3_000);
        for attempt in 1..10 {
            assert!(retry_delay(&p, attempt) <= Duration::from_secs(3));
        }
    }

    #[test]
    fn poll_backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(poll_backoff(base, 1), Duration::from_secs(1));
        assert_eq!(poll_backoff(base, 2), Duration::from_secs(2));
        assert_eq!(poll_backoff(base, 3), Duration::from_secs(4));
        assert_eq!(poll_backoff(base, 50), MAX_POLL_BACKOFF);
    }
}
