//! Redelivery backoff.
//!
//! A nacked message is not visible again until its backoff delay has passed.
//! The delay grows with the delivery attempt and is jittered so that a batch
//! of failures does not come back as a batch.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the base delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
    /// base
    Constant,
}

/// How the computed delay is randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    None,
    /// Uniform in `0..=delay`.
    #[default]
    Full,
    /// Half fixed, half uniform.
    Equal,
    /// Uniform in `base..=min(max, 3 * previous)`.
    Decorrelated,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Backoff applied when a delivery is nacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    /// Delay growth.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Delay randomization.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
    /// Delay after the first failed delivery, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RedeliveryPolicy {
    /// Redeliver immediately. Used by tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            backoff_strategy: BackoffStrategy::Constant,
            jitter_strategy: JitterStrategy::None,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Sets base and max delay.
    #[must_use]
    pub fn with_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.base_delay_ms = base;
        self.max_delay_ms = max;
        self
    }

    /// Delay before attempt `failed_attempt + 1` may be delivered.
    ///
    /// `failed_attempt` is 1-based: the first delivery is attempt 1.
    #[must_use]
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let delay = self.raw_delay(failed_attempt);
        let base = self.base_delay_ms.min(self.max_delay_ms);

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                // Redeliveries carry no state, so the previous delay is recomputed.
                let previous = self.raw_delay(failed_attempt.saturating_sub(1)).max(base);
                let upper = previous.saturating_mul(3).min(self.max_delay_ms);
                if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        Duration::from_millis(jittered)
    }

    fn raw_delay(&self, failed_attempt: u32) -> u64 {
        let base = self.base_delay_ms;
        let n = failed_attempt.max(1);
        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(n.saturating_sub(1)))
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(n)),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RedeliveryPolicy {
        RedeliveryPolicy::default()
            .with_backoff(strategy)
            .with_jitter(JitterStrategy::None)
            .with_delays_ms(100, 1_000)
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let linear = no_jitter(BackoffStrategy::Linear);
        assert_eq!(linear.delay_after(3), Duration::from_millis(300));

        let constant = no_jitter(BackoffStrategy::Constant);
        assert_eq!(constant.delay_after(7), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for jitter in [JitterStrategy::Full, JitterStrategy::Equal, JitterStrategy::Decorrelated] {
            let policy = no_jitter(BackoffStrategy::Exponential).with_jitter(jitter);
            for attempt in 1..8 {
                let delay = policy.delay_after(attempt);
                assert!(delay <= Duration::from_millis(1_000), "{jitter:?} {attempt}");
            }
        }

        let equal = no_jitter(BackoffStrategy::Constant).with_jitter(JitterStrategy::Equal);
        assert!(equal.delay_after(1) >= Duration::from_millis(50));
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(RedeliveryPolicy::immediate().delay_after(5), Duration::ZERO);
    }

    #[test]
    fn test_policy_from_json_defaults() {
        let policy: RedeliveryPolicy =
            serde_json::from_str(r#"{"backoff_strategy": "linear"}"#).unwrap();
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(policy.jitter_strategy, JitterStrategy::Full);
        assert_eq!(policy.base_delay_ms, 1_000);
    }
}
