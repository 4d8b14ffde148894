//! Retry Logic
//!
//! Exponential backoff for transient upstream failures. The delay before
//! attempt `n + 1` is `base * multiplier^(n - 1)`, capped at `max_delay`,
//! optionally widened by up to 25 % random jitter.

use crate::config::RetryConfig;
use std::time::Duration;

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create policy with exponential backoff (multiplier 2, 10 s cap, no jitter)
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Build from the `[retry]` configuration section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = if millis.is_finite() {
            Duration::from_millis(millis as u64).min(self.max_delay)
        } else {
            self.max_delay
        };

        if self.jitter {
            with_jitter(capped)
        } else {
            capped
        }
    }
}

/// Retry with jitter to prevent thundering herd
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = (duration.as_millis() / 4) as u64;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(10));

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(20));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(40));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(1000))
            .with_max_delay(Duration::from_millis(3000));

        assert_eq!(policy.calculate_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(3000));
        assert_eq!(policy.calculate_delay(30), Duration::from_millis(3000));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(10_000));
        assert!(!policy.jitter);
    }

    #[test]
    fn test_jitter() {
        let base = Duration::from_secs(1);
        let jittered = with_jitter(base);

        assert!(jittered >= base);
        assert!(jittered <= base + Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_on_tiny_delay_is_noop() {
        assert_eq!(with_jitter(Duration::from_millis(2)), Duration::from_millis(2));
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }
}
