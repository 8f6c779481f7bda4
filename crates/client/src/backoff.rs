//! Exponential backoff with multiplicative jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Largest exponent applied to `base_delay`; beyond this the cap always wins.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry is doubled.
    pub base_delay: Duration,
    /// Cap for the exponential part.
    pub max_delay: Duration,
    /// Upper bound of the random extra fraction (0.0-1.0) added on top.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Zero delay, zero jitter.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// `min(base * 2^retries, max_delay)`, without jitter.
    pub fn capped_delay(&self, retries: u32) -> Duration {
        let factor = 1u32 << retries.min(MAX_EXPONENT);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay to wait before the attempt that follows `retries` failures.
    pub fn delay(&self, retries: u32) -> Duration {
        let unit = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_unit(retries, unit)
    }

    /// Jitter is applied after the cap, so a jittered delay may exceed
    /// `max_delay` by at most `jitter_factor`.
    fn delay_with_unit(&self, retries: u32, unit: f64) -> Duration {
        let capped = self.capped_delay(retries);
        let jitter = self.jitter_factor.clamp(0.0, 1.0) * unit.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        Duration::try_from_secs_f64(capped.as_secs_f64() * (1.0 + jitter)).unwrap_or(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_until_capped() {
        let policy = BackoffPolicy::default().with_jitter_factor(0.0);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(5));
        }
        assert_eq!(policy.delay_with_unit(2, 1.0), Duration::from_secs(5));
    }

    proptest! {
        #[test]
        fn unjittered_delay_is_monotonic_and_capped(
            base_ms in 0u64..5_000,
            max_ms in 0u64..600_000,
            retries in 0u32..64,
        ) {
            let policy = BackoffPolicy::default()
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_jitter_factor(0.0);

            let current = policy.delay(retries);
            let next = policy.delay(retries + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= policy.max_delay);
        }
    }
}
