//! Reconnect backoff policy.
//!
//! Delays grow exponentially from an initial value up to a cap, and each delay
//! gets up to `jitter_ms` of random extra so many sessions restarting together
//! do not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Reconnection configuration for the feed session.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum backoff delay in seconds.
    pub max_delay_s: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum random jitter added to each delay, in milliseconds.
    pub jitter_ms: u64,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_s: 30,
            backoff_multiplier: 2.0,
            jitter_ms: 250,
            max_retries: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create from config values.
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_delay_ms: config.reconnect_initial_delay_ms,
            max_delay_s: config.reconnect_max_delay_s,
            jitter_ms: config.reconnect_jitter_ms,
            max_retries: config.max_retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let max_delay_ms = self.max_delay_s.saturating_mul(1000);
        let clamped_ms = delay_ms.min(max_delay_ms as f64).max(0.0) as u64;
        Duration::from_millis(clamped_ms)
    }

    /// Delay before retry number `attempt` (0-based), with jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    /// Check if `failures` consecutive failures exceed the retry cap.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }
}
