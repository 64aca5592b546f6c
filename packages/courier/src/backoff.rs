//! Delay between reconnection attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every attempt waits `base`.
    #[default]
    Fixed,
    /// `base * factor^(attempt - 1)`, capped at `max_delay`.
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn fixed(base: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base,
            factor: 1.0,
            max_delay: base,
        }
    }

    pub fn exponential(base: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            factor,
            max_delay,
        }
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(64) as i32;
                let scaled = self.base.as_secs_f64() * self.factor.powi(exp);
                if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
                    self.max_delay
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(5000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ignores_attempt() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(7), Duration::from_secs(5));
    }

    #[test]
    fn exponential_grows_and_caps() {
        let policy =
            ReconnectPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }
}
