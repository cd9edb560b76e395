//! Exponential backoff between failed sync attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::millis;

/// Backoff applied after a failed attempt before the engine re-arms itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    #[serde(with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Spread delays by +/- 25%.
    pub jitter: bool,
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after `attempt` consecutive failures (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        let max_delay = self.max_delay.as_millis() as f64;
        let capped_delay = base_delay.min(max_delay);

        let final_delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        // Jitter never pushes past the cap.
        Duration::from_millis(final_delay.min(max_delay) as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let config = BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(10))
            .with_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = BackoffConfig::new(Duration::from_millis(1000), Duration::from_secs(60));
        for _ in 0..100 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_jitter_respects_max_delay() {
        let config = BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(2));
        for attempt in 1..8 {
            for _ in 0..100 {
                let delay = config.delay_for_attempt(attempt);
                assert!(delay <= Duration::from_secs(2), "{:?} above cap", delay);
                assert!(delay >= Duration::from_millis(1500));
            }
        }
    }

    #[test]
    fn test_deserialize_millis() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{ "initial_delay_ms": 250, "jitter": false }"#).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert!(!config.jitter);
    }
}
