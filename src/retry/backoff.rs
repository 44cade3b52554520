//! Exponential backoff with jitter

use crate::error::{PusherError, Result};
use rand::Rng;
use std::time::Duration;

/// Stateless mapping from a zero-based attempt number to a retry delay.
///
/// A strategy is built once and passed by reference into every retry call;
/// it is never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffStrategy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_fraction: f64,
    max_attempts: u32,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.1,
            max_attempts: 3,
        }
    }
}

impl BackoffStrategy {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_fraction: f64,
        max_attempts: u32,
    ) -> Result<Self> {
        if base_delay.is_zero() {
            return Err(PusherError::Config(
                "backoff base delay must be greater than zero".to_string(),
            ));
        }
        if max_delay < base_delay {
            return Err(PusherError::Config(format!(
                "backoff max delay {:?} is smaller than base delay {:?}",
                max_delay, base_delay
            )));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(PusherError::Config(format!(
                "backoff multiplier must be >= 1.0, got {}",
                multiplier
            )));
        }
        if !(0.0..=1.0).contains(&jitter_fraction) {
            return Err(PusherError::Config(format!(
                "jitter fraction must be within [0, 1], got {}",
                jitter_fraction
            )));
        }
        if max_attempts == 0 {
            return Err(PusherError::Config(
                "max attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            base_delay,
            max_delay,
            multiplier,
            jitter_fraction,
            max_attempts,
        })
    }

    /// Strategy used for whole-image pushes: 1s base, 30s cap, `max_retries`
    /// retries on top of the first attempt.
    pub fn for_push(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.1,
            max_attempts: max_retries.saturating_add(1),
        }
    }

    /// Same delay before every retry.
    pub fn constant(delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_fraction: 0.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Wide jitter: the capped delay is scaled by a factor in `[0.5, 1.5]`.
    pub fn with_wide_jitter(mut self) -> Self {
        self.jitter_fraction = 0.5;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction.clamp(0.0, 1.0);
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after the given attempt, or `None` once the
    /// attempt budget is used up. Negative attempts count as attempt zero.
    pub fn next_delay(&self, attempt: i32) -> Option<Duration> {
        let attempt = attempt.max(0) as u32;
        if attempt >= self.max_attempts {
            return None;
        }

        let capped = self.capped_delay(attempt);
        if self.jitter_fraction <= 0.0 || capped.is_zero() {
            return Some(capped);
        }

        let low = 1.0 - self.jitter_fraction;
        let high = 1.0 + self.jitter_fraction;
        let factor = rand::thread_rng().gen_range(low..=high);
        Some(scale(capped, factor))
    }

    /// `min(base * multiplier^attempt, max)` before jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();

        if !scaled.is_finite() || scaled >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Upper bound any jittered delay can reach.
    pub fn delay_ceiling(&self) -> Duration {
        scale(self.max_delay, 1.0 + self.jitter_fraction)
    }
}

/// `delay * factor`, saturating at `Duration::MAX`.
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_after_max_attempts() {
        let strategy = BackoffStrategy::default();
        assert!(strategy.next_delay(0).is_some());
        assert!(strategy.next_delay(2).is_some());
        for attempt in 3..20 {
            assert_eq!(strategy.next_delay(attempt), None);
        }
    }

    #[test]
    fn test_negative_attempt_clamped() {
        let strategy = BackoffStrategy::default().with_jitter(0.0);
        assert_eq!(strategy.next_delay(-5), strategy.next_delay(0));
        assert_eq!(strategy.next_delay(-1), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_exponential_growth_until_cap() {
        let strategy = BackoffStrategy::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            0.0,
            10,
        )
        .unwrap();

        let delays: Vec<Duration> = (0..10).filter_map(|a| strategy.next_delay(a)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[4], Duration::from_secs(1));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_never_exceeds_ceiling() {
        let strategy = BackoffStrategy::new(
            Duration::from_millis(50),
            Duration::from_millis(400),
            3.0,
            0.25,
            8,
        )
        .unwrap();

        for _ in 0..200 {
            for attempt in 0..8 {
                let delay = strategy.next_delay(attempt).unwrap();
                assert!(delay <= strategy.delay_ceiling());
                let capped = strategy.capped_delay(attempt as u32);
                assert!(delay >= capped.mul_f64(0.75) - Duration::from_nanos(1));
            }
        }
    }

    #[test]
    fn test_wide_jitter_range() {
        let strategy = BackoffStrategy::constant(Duration::from_millis(100), 5).with_wide_jitter();
        for _ in 0..100 {
            let delay = strategy.next_delay(1).unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_huge_attempt_stays_capped() {
        let strategy = BackoffStrategy::for_push(u32::MAX - 1).with_jitter(0.0);
        assert_eq!(strategy.next_delay(5000), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        let base = Duration::from_millis(100);
        assert!(BackoffStrategy::new(Duration::ZERO, base, 2.0, 0.1, 3).is_err());
        assert!(BackoffStrategy::new(base, Duration::from_millis(10), 2.0, 0.1, 3).is_err());
        assert!(BackoffStrategy::new(base, base, 0.5, 0.1, 3).is_err());
        assert!(BackoffStrategy::new(base, base, 2.0, 1.5, 3).is_err());
        assert!(BackoffStrategy::new(base, base, 2.0, 0.1, 0).is_err());
    }

    #[test]
    fn test_for_push_attempts() {
        let strategy = BackoffStrategy::for_push(3);
        assert_eq!(strategy.max_attempts(), 4);
        assert_eq!(strategy.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_unbounded_max_delay_saturates() {
        let strategy =
            BackoffStrategy::new(Duration::from_secs(1), Duration::MAX, 2.0, 0.5, 100).unwrap();
        for _ in 0..64 {
            let delay = strategy.next_delay(99).unwrap();
            assert!(delay >= Duration::from_secs(u64::MAX / 4));
        }
        assert_eq!(strategy.delay_ceiling(), Duration::MAX);
    }
}
