//! Jittered exponential backoff used to compute a retry's `eligible_at`.

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const JITTER_MIN_SECS: f64 = 0.1;
pub const JITTER_MAX_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSchedule {
    base: f64,
    max_delay: Duration,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_MAX_DELAY)
    }
}

impl BackoffSchedule {
    pub fn new(base: f64, max_delay: Duration) -> Self {
        Self {
            base: base.max(1.0),
            max_delay,
        }
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// `base^retry + jitter`, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32, jitter_secs: f64) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base.powi(exponent) + jitter_secs.max(0.0);
        let cap = self.max_delay.as_secs_f64();
        if !raw.is_finite() || raw >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(raw)
    }

    pub fn delay_with_jitter(&self, retry: u32) -> Duration {
        let jitter = rand::rng().random_range(JITTER_MIN_SECS..=JITTER_MAX_SECS);
        self.delay_for(retry, jitter)
    }
}
