//! Exponential backoff calculation for the retry executor.

use std::time::Duration;

use rand::Rng;

use crate::retry::RetryPolicy;

/// Delay before retry number `attempt + 1`.
///
/// `attempt` is zero-based: attempt 0 yields `base_delay` (scaled by jitter
/// when enabled). The raw delay grows as `base_delay * backoff_factor^attempt`
/// and is capped at `max_delay`; a factor <= 1 simply degenerates to a
/// constant delay. With jitter enabled the capped delay is multiplied by a
/// uniform value in `[0.5, 1.5)` so synchronized callers do not retry in
/// lockstep.
pub fn delay_for_attempt(attempt: u32, policy: &RetryPolicy) -> Duration {
    let raw = raw_delay(attempt, policy);
    if policy.jitter {
        apply_jitter(raw, rand::thread_rng().gen_range(0.5..1.5))
    } else {
        raw
    }
}

/// Deterministic part of the delay schedule (no jitter applied).
pub fn raw_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let grown = policy.base_delay.as_secs_f64() * policy.backoff_factor.powi(attempt as i32);
    let capped = grown.min(policy.max_delay.as_secs_f64()).max(0.0);
    Duration::from_secs_f64(capped)
}

fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicates;

    fn policy(base_ms: u64, max_ms: u64, factor: f64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
            jitter: false,
            predicate: predicates::default_retriable,
        }
    }

    #[test]
    fn attempt_zero_is_base_delay() {
        let p = policy(100, 10_000, 2.0);
        assert_eq!(delay_for_attempt(0, &p), Duration::from_millis(100));
    }

    #[test]
    fn grows_monotonically_until_cap() {
        let p = policy(100, 1_500, 2.0);
        let mut prev = Duration::ZERO;
        for attempt in 0..10 {
            let d = delay_for_attempt(attempt, &p);
            assert!(d >= prev, "delay shrank at attempt {attempt}");
            assert!(d <= Duration::from_millis(1_500));
            prev = d;
        }
        // 100 * 2^4 = 1600 > cap, so attempt 4 onwards is pinned to max.
        assert_eq!(delay_for_attempt(4, &p), Duration::from_millis(1_500));
        assert_eq!(delay_for_attempt(9, &p), Duration::from_millis(1_500));
    }

    #[test]
    fn factor_at_most_one_is_constant() {
        let p = policy(250, 5_000, 1.0);
        for attempt in 0..6 {
            assert_eq!(delay_for_attempt(attempt, &p), Duration::from_millis(250));
        }
        let shrink = policy(250, 5_000, 0.5);
        assert!(delay_for_attempt(3, &shrink) <= Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let mut p = policy(200, 10_000, 2.0);
        p.jitter = true;
        for _ in 0..200 {
            let d = delay_for_attempt(0, &p);
            assert!(d >= Duration::from_millis(100), "jitter below 0.5x: {d:?}");
            assert!(d < Duration::from_millis(300), "jitter at/above 1.5x: {d:?}");
        }
    }

    #[test]
    fn jitter_factor_applied_multiplicatively() {
        assert_eq!(
            apply_jitter(Duration::from_millis(100), 0.5),
            Duration::from_millis(50)
        );
        assert_eq!(
            apply_jitter(Duration::from_millis(100), 1.25),
            Duration::from_millis(125)
        );
    }
}
