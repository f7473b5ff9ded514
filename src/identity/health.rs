use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Weight given to the newest latency sample.
pub(crate) const LATENCY_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

/// Live health record of one egress identity.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_latency: Option<Duration>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub state: HealthState,
}

impl Default for IdentityHealth {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_latency: None,
            last_success_at: None,
            last_failure_at: None,
            state: HealthState::Healthy,
        }
    }
}

impl IdentityHealth {
    /// Unused identities rank as perfect.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == HealthState::Failed
    }

    /// Live success. A FAILED identity keeps its state until a probe revives it.
    pub(crate) fn record_success(&mut self, latency: Duration, now: DateTime<Utc>) -> HealthState {
        self.success_count = self.success_count.saturating_add(1);
        self.last_success_at = Some(now);
        self.observe_latency(latency);
        if self.state != HealthState::Failed {
            self.consecutive_failures = 0;
            self.state = HealthState::Healthy;
        }
        self.state
    }

    pub(crate) fn record_failure(&mut self, now: DateTime<Utc>, threshold: u32) -> HealthState {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
        self.bump_failures(threshold)
    }

    /// Probe success is the only way out of FAILED.
    pub(crate) fn record_probe_success(&mut self, latency: Duration) -> HealthState {
        self.consecutive_failures = 0;
        self.observe_latency(latency);
        self.state = HealthState::Healthy;
        self.state
    }

    pub(crate) fn record_probe_failure(&mut self, threshold: u32) -> HealthState {
        self.bump_failures(threshold)
    }

    fn bump_failures(&mut self, threshold: u32) -> HealthState {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = if self.consecutive_failures >= threshold {
            HealthState::Failed
        } else {
            HealthState::Degraded
        };
        self.state
    }

    fn observe_latency(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64();
        let next = match self.avg_latency {
            Some(current) => {
                LATENCY_EMA_ALPHA * sample + (1.0 - LATENCY_EMA_ALPHA) * current.as_secs_f64()
            }
            None => sample,
        };
        self.avg_latency = Some(Duration::from_secs_f64(next.max(0.0)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_degrade_then_fail_at_threshold() {
        let mut health = IdentityHealth::default();
        let now = Utc::now();
        assert_eq!(health.record_failure(now, 3), HealthState::Degraded);
        assert_eq!(health.record_failure(now, 3), HealthState::Degraded);
        assert_eq!(health.record_failure(now, 3), HealthState::Failed);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.failure_count, 3);
        assert_eq!(health.last_failure_at, Some(now));
    }

    #[test]
    fn success_resets_streak() {
        let mut health = IdentityHealth::default();
        let now = Utc::now();
        health.record_failure(now, 3);
        assert_eq!(
            health.record_success(Duration::from_millis(100), now),
            HealthState::Healthy
        );
        assert_eq!(health.consecutive_failures, 0);
        assert!((health.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn live_success_does_not_revive_failed_identity() {
        let mut health = IdentityHealth::default();
        let now = Utc::now();
        for _ in 0..3 {
            health.record_failure(now, 3);
        }
        assert_eq!(
            health.record_success(Duration::from_millis(10), now),
            HealthState::Failed
        );
        assert_eq!(health.success_count, 1);
        assert_eq!(health.consecutive_failures, 3);

        assert_eq!(
            health.record_probe_success(Duration::from_millis(10)),
            HealthState::Healthy
        );
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn probe_failure_leaves_counters_alone() {
        let mut health = IdentityHealth::default();
        assert_eq!(health.record_probe_failure(2), HealthState::Degraded);
        assert_eq!(health.record_probe_failure(2), HealthState::Failed);
        assert_eq!(health.failure_count, 0);
        assert!(health.last_failure_at.is_none());
    }

    #[test]
    fn latency_is_exponentially_averaged() {
        let mut health = IdentityHealth::default();
        let now = Utc::now();
        health.record_success(Duration::from_millis(100), now);
        assert_eq!(health.avg_latency, Some(Duration::from_millis(100)));
        health.record_success(Duration::from_millis(200), now);
        let avg = health.avg_latency.unwrap().as_secs_f64();
        assert!((avg - 0.13).abs() < 1e-9, "avg was {avg}");
    }

    #[test]
    fn unused_identity_ranks_perfect() {
        assert_eq!(IdentityHealth::default().success_rate(), 1.0);
    }
}
