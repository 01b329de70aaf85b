//! Retry policy for transiently failing mutations

use rand::Rng;
use std::time::Duration;

use crate::config::SyncConfig;

/// Exponential backoff with a cap and optional full jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a mutation goes dead
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: config.jitter,
        }
    }

    /// Upper bound of the delay after `attempts` failures (base * 2^(attempts-1), capped)
    pub fn ceiling(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let factor = 1u64 << exp;
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max)
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let ceiling = self.ceiling(attempts);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Whether a mutation that has failed `attempts` times is out of retries
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
