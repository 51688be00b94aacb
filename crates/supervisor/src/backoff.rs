//! Reconnect policy with jittered exponential back-off.

use std::time::Duration;

use pk_domain::config::BackoffConfig;
use rand::Rng;

/// Controls how long a group waits before each reconnect attempt.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt (before jitter).
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap, applied after jitter).
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Jitter spread: the factor is drawn from `[1.0, 1.0 + jitter)`.
    pub jitter: f64,
    /// Attempts per failure streak before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(cfg: &BackoffConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_factor: cfg.multiplier,
            jitter: cfg.jitter,
            max_attempts: cfg.max_attempts,
        }
    }

    /// Compute the delay for the given attempt number (0-indexed) using a
    /// fresh jitter draw.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, self.draw_jitter())
    }

    /// `min(max_delay, initial_delay × factor^attempt × jitter_factor)`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.backoff_factor.powi(exponent) * jitter_factor;
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// Whether the given attempt number has reached the max.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    fn draw_jitter(&self) -> f64 {
        if self.jitter <= 0.0 {
            return 1.0;
        }
        rand::thread_rng().gen_range(1.0..1.0 + self.jitter)
    }
}
