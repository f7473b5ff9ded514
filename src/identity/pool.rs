//! Rotating pool of egress identities.
//!
//! Every identity owns its own health lock, so outcome reports from workers
//! and probe results from the monitor serialize per identity without
//! contending on a pool-wide lock. Identities are never removed; FAILED ones
//! only drop out of selection until a probe revives them.

use super::health::{HealthState, IdentityHealth};
use crate::runtime::config::IdentitySpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Identities whose success rate is this close to the best share the rotation.
const TOP_TIER_RATE_WINDOW: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub usize);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity-{}", self.0)
    }
}

#[derive(Debug)]
pub struct EgressIdentity {
    id: IdentityId,
    proxy: Option<String>,
    user_agent: Option<String>,
    profile: Option<String>,
    health: Mutex<IdentityHealth>,
}

impl EgressIdentity {
    pub fn from_spec(id: IdentityId, spec: &IdentitySpec) -> Self {
        Self {
            id,
            proxy: spec.proxy.clone(),
            user_agent: spec.user_agent.clone(),
            profile: spec.profile.clone(),
            health: Mutex::new(IdentityHealth::default()),
        }
    }

    pub fn id(&self) -> IdentityId {
        self.id
    }

    /// Proxy URL, or `None` for direct egress.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn endpoint(&self) -> &str {
        self.proxy.as_deref().unwrap_or("direct")
    }

    /// User agent pinned in configuration, if any.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn health(&self) -> IdentityHealth {
        self.health.lock().expect("identity health mutex poisoned").clone()
    }

    fn update<F>(&self, apply: F) -> (HealthState, HealthState, u32)
    where
        F: FnOnce(&mut IdentityHealth) -> HealthState,
    {
        let mut health = self.health.lock().expect("identity health mutex poisoned");
        let previous = health.state;
        let next = apply(&mut health);
        (previous, next, health.consecutive_failures)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No identity outside FAILED is available.
    Exhausted { total: usize },
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Exhausted { total } => {
                write!(f, "all {total} egress identities are marked failed")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityStats {
    pub endpoint: String,
    pub state: HealthState,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    pub per_identity: BTreeMap<IdentityId, IdentityStats>,
}

#[derive(Debug)]
pub struct IdentityPool {
    identities: Vec<Arc<EgressIdentity>>,
    max_consecutive_failures: u32,
    cursor: AtomicUsize,
}

impl IdentityPool {
    pub fn new(specs: &[IdentitySpec], max_consecutive_failures: u32) -> Self {
        let identities = specs
            .iter()
            .enumerate()
            .map(|(idx, spec)| Arc::new(EgressIdentity::from_spec(IdentityId(idx), spec)))
            .collect();
        Self {
            identities,
            max_consecutive_failures: max_consecutive_failures.max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[Arc<EgressIdentity>] {
        &self.identities
    }

    pub fn get(&self, id: IdentityId) -> Option<&Arc<EgressIdentity>> {
        self.identities.get(id.0)
    }

    /// Picks the least risky identity: non-FAILED only, ranked by success rate
    /// then latency, rotating round-robin across the top tier.
    pub fn select(&self) -> Result<Arc<EgressIdentity>, IdentityError> {
        let mut candidates: Vec<(usize, f64, Duration)> = self
            .identities
            .iter()
            .enumerate()
            .filter_map(|(idx, identity)| {
                let health = identity.health();
                (!health.is_failed()).then(|| {
                    (
                        idx,
                        health.success_rate(),
                        health.avg_latency.unwrap_or(Duration::ZERO),
                    )
                })
            })
            .collect();

        if candidates.is_empty() {
            return Err(IdentityError::Exhausted {
                total: self.identities.len(),
            });
        }

        let best_rate = candidates
            .iter()
            .map(|(_, rate, _)| *rate)
            .fold(f64::MIN, f64::max);
        candidates.retain(|(_, rate, _)| *rate >= best_rate - TOP_TIER_RATE_WINDOW);
        candidates.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        let (idx, _, _) = candidates[turn % candidates.len()];
        Ok(self.identities[idx].clone())
    }

    /// Outcome of a live fetch through `id`.
    pub fn record_outcome(&self, id: IdentityId, success: bool, latency: Duration) {
        let Some(identity) = self.get(id) else {
            tracing::warn!(identity = %id, "outcome reported for unknown identity");
            return;
        };
        let now = Utc::now();
        let threshold = self.max_consecutive_failures;
        let (previous, next, streak) = identity.update(|health| {
            if success {
                health.record_success(latency, now)
            } else {
                health.record_failure(now, threshold)
            }
        });
        log_transition(identity, previous, next, streak, "outcome");
    }

    /// Result of a health probe. `latency` is only meaningful on success.
    pub fn record_probe(&self, id: IdentityId, success: bool, latency: Duration) {
        let Some(identity) = self.get(id) else {
            tracing::warn!(identity = %id, "probe reported for unknown identity");
            return;
        };
        let threshold = self.max_consecutive_failures;
        let (previous, next, streak) = identity.update(|health| {
            if success {
                health.record_probe_success(latency)
            } else {
                health.record_probe_failure(threshold)
            }
        });
        log_transition(identity, previous, next, streak, "probe");
    }

    pub fn stats(&self) -> IdentityPoolStats {
        let mut stats = IdentityPoolStats {
            total: self.identities.len(),
            healthy: 0,
            degraded: 0,
            failed: 0,
            per_identity: BTreeMap::new(),
        };

        for identity in &self.identities {
            let health = identity.health();
            match health.state {
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Degraded => stats.degraded += 1,
                HealthState::Failed => stats.failed += 1,
            }
            stats.per_identity.insert(
                identity.id(),
                IdentityStats {
                    endpoint: identity.endpoint().to_owned(),
                    state: health.state,
                    success_rate: health.success_rate(),
                    avg_latency_ms: health
                        .avg_latency
                        .map(|latency| latency.as_secs_f64() * 1_000.0),
                    consecutive_failures: health.consecutive_failures,
                    success_count: health.success_count,
                    failure_count: health.failure_count,
                    last_success_at: health.last_success_at,
                    last_failure_at: health.last_failure_at,
                },
            );
        }

        stats
    }
}

fn log_transition(
    identity: &EgressIdentity,
    previous: HealthState,
    next: HealthState,
    consecutive_failures: u32,
    source: &'static str,
) {
    if previous != next {
        tracing::warn!(
            identity = %identity.id(),
            endpoint = identity.endpoint(),
            previous = ?previous,
            next = ?next,
            consecutive_failures,
            source,
            "egress identity health changed"
        );
    }
}
