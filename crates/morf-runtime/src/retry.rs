//! Backoff computation between invocation attempts.
//!
//! The policy types live in the kernel; this module turns them into actual
//! sleep durations, sampling jitter where the policy asks for it.

use rand::Rng;
use std::time::Duration;

use morf_kernel::policy::RetryConfig;

/// Sleep duration after the given 1-based attempt failed.
///
/// Jittered policies sample uniformly in \[75%, 100%\] of the computed
/// delay so concurrent retries spread out instead of thundering back in
/// lockstep.
pub fn delay_for(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.policy.base_delay_ms(attempt);
    let ms = if config.policy.jitter() && base > 0 {
        let floor = base.saturating_mul(3) / 4;
        rand::thread_rng().gen_range(floor..=base)
    } else {
        base
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use morf_kernel::policy::RetryPolicy;

    #[test]
    fn fixed_policy_is_exact() {
        let config = RetryConfig::fixed(3, 250);
        assert_eq!(delay_for(&config, 1), Duration::from_millis(250));
        assert_eq!(delay_for(&config, 2), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_inside_the_band() {
        let config = RetryConfig::exponential(5, 100, 10_000);
        for attempt in 1..=5u32 {
            let base = config.policy.base_delay_ms(attempt);
            let floor = base * 3 / 4;
            for _ in 0..32 {
                let d = delay_for(&config, attempt).as_millis() as u64;
                assert!(d >= floor && d <= base, "{d} outside [{floor}, {base}]");
            }
        }
    }

    #[test]
    fn unjittered_exponential_is_deterministic() {
        let config = RetryConfig {
            max_attempts: 4,
            policy: RetryPolicy::ExponentialBackoff {
                base_ms: 100,
                max_ms: 300,
                jitter: false,
            },
        };
        assert_eq!(delay_for(&config, 1), Duration::from_millis(100));
        assert_eq!(delay_for(&config, 2), Duration::from_millis(200));
        assert_eq!(delay_for(&config, 3), Duration::from_millis(300));
    }

    #[test]
    fn zero_delay_never_panics() {
        let config = RetryConfig::fixed(2, 0);
        assert_eq!(delay_for(&config, 1), Duration::ZERO);
    }
}
