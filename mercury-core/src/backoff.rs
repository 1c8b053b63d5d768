//! Bounded geometric retry delays
//!
//! The counter hands out the delay to wait before the next retry and then
//! grows it by `multiplier`, capped at `maximum`. A successful open resets it.

use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);

/// Default upper bound on retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default growth factor between consecutive retries
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Backoff bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub minimum: Duration,
    pub maximum: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            minimum: DEFAULT_MIN_DELAY,
            maximum: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Retry delay state, owned by a single supervisor
#[derive(Debug, Clone)]
pub struct BackoffCounter {
    minimum: Duration,
    maximum: Duration,
    multiplier: f64,
    current: Duration,
}

impl BackoffCounter {
    /// Create a counter. Bounds are normalised so that `minimum <= maximum`
    /// and the multiplier never shrinks the delay.
    pub fn new(config: BackoffConfig) -> Self {
        let minimum = config.minimum.min(config.maximum);
        let maximum = config.maximum.max(minimum);
        let multiplier = if config.multiplier.is_finite() && config.multiplier >= 1.0 {
            config.multiplier
        } else {
            1.0
        };

        Self {
            minimum,
            maximum,
            multiplier,
            current: minimum,
        }
    }

    /// Make the next delay equal to `minimum`
    pub fn reset(&mut self) {
        self.current = self.minimum;
    }

    /// Return the delay to wait now, then advance
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .mul_f64(self.multiplier)
            .clamp(self.minimum, self.maximum);
        delay
    }
}

impl Default for BackoffCounter {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_doubles_until_cap() {
        let mut backoff = BackoffCounter::default();
        let delays: Vec<f64> = (0..9).map(|_| backoff.next().as_secs_f64()).collect();
        assert_eq!(delays, vec![0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 32.0, 32.0]);
    }

    #[test]
    fn test_reset_returns_to_minimum() {
        let mut backoff = BackoffCounter::default();
        backoff.next();
        backoff.next();
        backoff.next();

        backoff.reset();
        assert_eq!(backoff.next(), DEFAULT_MIN_DELAY);

        // reset is idempotent
        backoff.reset();
        backoff.reset();
        assert_eq!(backoff.next(), DEFAULT_MIN_DELAY);
    }

    #[test]
    fn test_non_decreasing_and_bounded() {
        let configs = [
            BackoffConfig::default(),
            BackoffConfig {
                minimum: Duration::from_millis(300),
                maximum: Duration::from_millis(1000),
                multiplier: 1.7,
            },
            BackoffConfig {
                minimum: Duration::from_secs(1),
                maximum: Duration::from_secs(1),
                multiplier: 3.0,
            },
        ];

        for config in configs {
            let mut backoff = BackoffCounter::new(config);
            let mut previous = Duration::ZERO;
            for _ in 0..50 {
                let delay = backoff.next();
                assert!(delay >= previous, "{delay:?} < {previous:?}");
                assert!(delay <= config.maximum);
                assert!(delay >= config.minimum);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_invalid_bounds_are_normalised() {
        let mut backoff = BackoffCounter::new(BackoffConfig {
            minimum: Duration::from_secs(10),
            maximum: Duration::from_secs(2),
            multiplier: 0.25,
        });

        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(2));
    }
}
