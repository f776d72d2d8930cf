//! Delay between retry attempts.

use dispatch_config::{BackoffStrategy, RetryConfig};
use rand::Rng;
use std::time::Duration;

/// Computes the wait after a failed attempt.
///
/// | Strategy | Delay after attempt `n` |
/// |----------|-------------------------|
/// | `Fixed` | `base` |
/// | `Linear` | `base * n` |
/// | `Exponential` | `base * 2^(n-1)` |
/// | `ExponentialWithJitter` | exponential delay `± jitter_factor` |
///
/// Every delay is capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffCalculator {
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl BackoffCalculator {
    /// Creates a calculator without jitter.
    #[must_use]
    pub const fn new(strategy: BackoffStrategy, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy,
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    /// Creates a calculator from the retry section.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.backoff, config.base_delay(), config.max_delay())
            .with_jitter(config.jitter_factor)
    }

    /// Sets the jitter factor, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = if jitter_factor.is_finite() {
            jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Returns the delay after `attempt` (1-based) failed.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::thread_rng().gen_range(-1.0..=1.0))
    }

    /// Returns the delay for a given jitter sample in `-1.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self.exponential(attempt),
            BackoffStrategy::ExponentialWithJitter => {
                let delay = self.exponential(attempt).min(self.max_delay);
                let factor = (1.0 + self.jitter_factor * sample.clamp(-1.0, 1.0)).max(0.0);
                Duration::from_nanos((delay.as_nanos() as f64 * factor).round() as u64)
            }
        };
        delay.min(self.max_delay)
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_strategies() {
        let fixed = BackoffCalculator::new(BackoffStrategy::Fixed, ms(100), ms(1000));
        assert_eq!(fixed.delay(1), ms(100));
        assert_eq!(fixed.delay(5), ms(100));

        let linear = BackoffCalculator::new(BackoffStrategy::Linear, ms(100), ms(1000));
        assert_eq!(linear.delay(3), ms(300));
        assert_eq!(linear.delay(20), ms(1000));

        let exponential = BackoffCalculator::new(BackoffStrategy::Exponential, ms(10), ms(1000));
        assert_eq!(exponential.delay(1), ms(10));
        assert_eq!(exponential.delay(2), ms(20));
        assert_eq!(exponential.delay(4), ms(80));
        assert_eq!(exponential.delay(40), ms(1000));
    }

    #[test]
    fn test_jitter_bounds() {
        let jittered = BackoffCalculator::new(BackoffStrategy::ExponentialWithJitter, ms(100), ms(10_000))
            .with_jitter(0.5);
        assert_eq!(jittered.delay_with(2, -1.0), ms(100));
        assert_eq!(jittered.delay_with(2, 0.0), ms(200));
        assert_eq!(jittered.delay_with(2, 1.0), ms(300));
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let calculator = BackoffCalculator::new(BackoffStrategy::ExponentialWithJitter, ms(100), ms(1000))
            .with_jitter(f64::NAN);
        assert_eq!(calculator.delay_with(1, 1.0), ms(100));

        let calculator = calculator.with_jitter(7.0);
        assert_eq!(calculator.delay_with(1, -1.0), Duration::ZERO);
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            backoff: BackoffStrategy::Linear,
            base_delay_ms: 50,
            max_delay_ms: 120,
            ..RetryConfig::default()
        };
        let calculator = BackoffCalculator::from_config(&config);
        assert_eq!(calculator.delay(2), ms(100));
        assert_eq!(calculator.delay(3), ms(120));
    }

    fn strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Fixed),
            Just(BackoffStrategy::Linear),
            Just(BackoffStrategy::Exponential),
            Just(BackoffStrategy::ExponentialWithJitter),
        ]
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_max(
            strategy in strategy(),
            base in 0u64..10_000,
            max in 0u64..100_000,
            jitter in 0.0f64..=1.0,
            attempt in 1u32..200,
            sample in -1.0f64..=1.0,
        ) {
            let calculator = BackoffCalculator::new(strategy, ms(base), ms(max)).with_jitter(jitter);
            prop_assert!(calculator.delay_with(attempt, sample) <= ms(max));
        }

        #[test]
        fn prop_exponential_is_monotonic(
            base in 1u64..1_000,
            max in 1u64..1_000_000,
            attempt in 1u32..100,
        ) {
            let calculator = BackoffCalculator::new(BackoffStrategy::Exponential, ms(base), ms(max));
            prop_assert!(calculator.delay(attempt) <= calculator.delay(attempt + 1));
        }

        #[test]
        fn prop_jitter_stays_within_factor(
            base in 1u64..1_000,
            jitter in 0.0f64..=1.0,
            attempt in 1u32..10,
            sample in -1.0f64..=1.0,
        ) {
            let calculator = BackoffCalculator::new(BackoffStrategy::ExponentialWithJitter, ms(base), Duration::MAX)
                .with_jitter(jitter);
            let nominal = ms(base).saturating_mul(1 << (attempt - 1)).as_secs_f64();
            let delay = calculator.delay_with(attempt, sample).as_secs_f64();
            prop_assert!(delay >= nominal * (1.0 - jitter) - 1e-6);
            prop_assert!(delay <= nominal * (1.0 + jitter) + 1e-6);
        }
    }
}
