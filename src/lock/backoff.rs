//! Retry schedule for contended lock acquires.
//!
//! Exponential growth from a small initial delay up to a cap, with +/-10%
//! jitter so waiters released at the same moment do not retry in lockstep.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between lock acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// First delay in milliseconds.
    pub initial_ms: u64,
    /// Maximum delay in milliseconds.
    pub max_ms: u64,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(10, 1000, 1.5)
    }
}

impl Backoff {
    /// Creates a backoff schedule.
    #[must_use]
    pub const fn new(initial_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        Self {
            initial_ms,
            max_ms,
            multiplier,
        }
    }

    /// Returns the first delay.
    #[must_use]
    pub const fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// Calculates the delay after `current`, capped at the maximum.
    #[must_use]
    pub fn next_interval(&self, current: Duration) -> Duration {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms.clamp(self.initial_ms, self.max_ms))
    }

    /// Applies jitter to an interval to prevent thundering herd.
    ///
    /// Adds random jitter of +/-10% to the interval.
    #[must_use]
    pub fn apply_jitter(&self, interval: Duration) -> Duration {
        let jitter_factor = rand::random::<f64>().mul_add(0.2, 0.9); // +/-10%
        Duration::from_secs_f64(interval.as_secs_f64() * jitter_factor)
    }
}
