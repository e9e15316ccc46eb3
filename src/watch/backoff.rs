//! Reconnect backoff policy
//!
//! Pure computation: attempt count in, delay out. The delay doubles from a
//! base, is clamped at a cap, and carries ±20% jitter so a fleet of watchers
//! losing the same server does not reconnect in lockstep. After any
//! successful connect the attempt counter resets and the sequence starts
//! over from the base.

use rand::Rng;
use std::time::Duration;

use crate::config::WatchConfig;

/// Jitter applied around the computed delay
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_cap_secs),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before reconnect attempt `attempt` (1-based), jittered.
    ///
    /// Returns `None` once the attempt budget is exhausted; the watcher then
    /// parks itself disconnected until a manual restart.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let raw = self.raw_delay(attempt);
        let jitter = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        Some(raw.mul_f64(jitter).min(self.cap))
    }

    /// The un-jittered curve: `min(base * 2^(attempt-1), cap)`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
