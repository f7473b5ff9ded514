//! Per-domain concurrency limits and adaptive pacing.
//!
//! Each domain has a slot counting in-flight fetches (never above the
//! configured limit) and an inter-request delay adjusted from observed
//! latency. Permits release their slot on drop and wake the frontier.

use super::frontier::Frontier;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_THROTTLE_START_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_THROTTLE_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_THROTTLE_TARGET_CONCURRENCY: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleSettings {
    pub enabled: bool,
    pub start_delay: Duration,
    pub max_delay: Duration,
    pub target_concurrency: f64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay: DEFAULT_THROTTLE_START_DELAY,
            max_delay: DEFAULT_THROTTLE_MAX_DELAY,
            target_concurrency: DEFAULT_THROTTLE_TARGET_CONCURRENCY,
        }
    }
}

impl ThrottleSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// `max(latency / target, (current + latency / target) / 2)`, never lower
    /// after a failed response, clamped to `[start_delay, max_delay]`.
    pub fn next_delay(&self, current: Duration, latency: Duration, success: bool) -> Duration {
        let target = latency.as_secs_f64() / self.target_concurrency;
        let averaged = (current.as_secs_f64() + target) / 2.0;
        let mut next = target.max(averaged);
        if !success {
            next = next.max(current.as_secs_f64());
        }
        let next = next.clamp(
            self.start_delay.as_secs_f64(),
            self.max_delay.as_secs_f64(),
        );
        Duration::from_secs_f64(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DomainSnapshot {
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub delay_ms: u64,
}

#[derive(Debug)]
struct DomainSlot {
    in_flight: usize,
    max_in_flight: usize,
    delay: Duration,
    next_allowed_at: Instant,
}

struct GatesInner {
    per_domain: usize,
    throttle: ThrottleSettings,
    slots: Mutex<HashMap<String, DomainSlot>>,
    frontier: Arc<Frontier>,
}

#[derive(Clone)]
pub(crate) struct DomainGates {
    inner: Arc<GatesInner>,
}

impl DomainGates {
    pub(crate) fn new(
        per_domain: usize,
        throttle: ThrottleSettings,
        frontier: Arc<Frontier>,
    ) -> Self {
        Self {
            inner: Arc::new(GatesInner {
                per_domain: per_domain.max(1),
                throttle,
                slots: Mutex::new(HashMap::new()),
                frontier,
            }),
        }
    }

    /// Claims a slot for `domain`, or says when to look again.
    pub(crate) fn try_admit(&self, domain: &str) -> Result<DomainPermit, Option<Instant>> {
        let now = Instant::now();
        let throttle = self.inner.throttle;
        let mut slots = self.inner.slots.lock().expect("domain gate mutex poisoned");
        let slot = slots.entry(domain.to_owned()).or_insert_with(|| DomainSlot {
            in_flight: 0,
            max_in_flight: 0,
            delay: throttle.start_delay,
            next_allowed_at: now,
        });

        if slot.in_flight >= self.inner.per_domain {
            return Err(None);
        }
        if throttle.enabled && now < slot.next_allowed_at {
            return Err(Some(slot.next_allowed_at));
        }

        slot.in_flight += 1;
        slot.max_in_flight = slot.max_in_flight.max(slot.in_flight);
        if throttle.enabled {
            slot.next_allowed_at = now + slot.delay;
        }

        Ok(DomainPermit {
            gates: self.inner.clone(),
            domain: domain.to_owned(),
        })
    }

    /// Feeds one observed response latency into the domain's pacing.
    pub(crate) fn observe(&self, domain: &str, latency: Duration, success: bool) {
        let throttle = self.inner.throttle;
        if !throttle.enabled {
            return;
        }
        let mut slots = self.inner.slots.lock().expect("domain gate mutex poisoned");
        if let Some(slot) = slots.get_mut(domain) {
            let next = throttle.next_delay(slot.delay, latency, success);
            if next != slot.delay {
                tracing::trace!(
                    domain,
                    previous_ms = slot.delay.as_millis() as u64,
                    next_ms = next.as_millis() as u64,
                    latency_ms = latency.as_millis() as u64,
                    "auto-throttle adjusted domain delay"
                );
            }
            slot.delay = next;
        }
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, DomainSnapshot> {
        let slots = self.inner.slots.lock().expect("domain gate mutex poisoned");
        slots
            .iter()
            .map(|(domain, slot)| {
                (
                    domain.clone(),
                    DomainSnapshot {
                        in_flight: slot.in_flight,
                        max_in_flight: slot.max_in_flight,
                        delay_ms: slot.delay.as_millis() as u64,
                    },
                )
            })
            .collect()
    }
}

/// Holds one in-flight slot for a domain until dropped.
pub(crate) struct DomainPermit {
    gates: Arc<GatesInner>,
    domain: String,
}

impl Drop for DomainPermit {
    fn drop(&mut self) {
        {
            let mut slots = self.gates.slots.lock().expect("domain gate mutex poisoned");
            if let Some(slot) = slots.get_mut(&self.domain) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
        self.gates.frontier.wake();
    }
}
