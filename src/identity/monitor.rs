//! Background re-validation of every egress identity, FAILED ones included.
//! Probes only touch identity health; they never produce dead letters.

use super::health::HealthState;
use super::pool::IdentityPool;
use crate::net::Prober;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub probed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Identities that went from FAILED back to HEALTHY in this round.
    pub recovered: usize,
}

pub struct HealthMonitor {
    pool: Arc<IdentityPool>,
    prober: Arc<dyn Prober>,
    probe_url: String,
    probe_timeout: Duration,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<IdentityPool>,
        prober: Arc<dyn Prober>,
        probe_url: impl Into<String>,
        probe_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            prober,
            probe_url: probe_url.into(),
            probe_timeout,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probes every identity concurrently and records each result.
    pub async fn probe_all(&self) -> ProbeSummary {
        let probes = self.pool.identities().iter().map(|identity| async move {
            let was_failed = identity.health().state == HealthState::Failed;
            let result = time::timeout(
                self.probe_timeout,
                self.prober
                    .probe(identity, &self.probe_url, self.probe_timeout),
            )
            .await;

            match result {
                Ok(Ok(latency)) => {
                    self.pool.record_probe(identity.id(), true, latency);
                    (true, was_failed)
                }
                Ok(Err(failure)) => {
                    tracing::debug!(
                        identity = %identity.id(),
                        endpoint = identity.endpoint(),
                        error = %failure,
                        "health probe failed"
                    );
                    self.pool.record_probe(identity.id(), false, Duration::ZERO);
                    (false, was_failed)
                }
                Err(_) => {
                    tracing::debug!(
                        identity = %identity.id(),
                        endpoint = identity.endpoint(),
                        timeout_ms = self.probe_timeout.as_millis() as u64,
                        "health probe timed out"
                    );
                    self.pool.record_probe(identity.id(), false, Duration::ZERO);
                    (false, was_failed)
                }
            }
        });

        let mut summary = ProbeSummary::default();
        for (succeeded, was_failed) in join_all(probes).await {
            summary.probed += 1;
            if succeeded {
                summary.succeeded += 1;
                if was_failed {
                    summary.recovered += 1;
                }
            } else {
                summary.failed += 1;
            }
        }
        summary
    }

    /// Runs `probe_all` every interval until `shutdown` fires. The first round
    /// happens one interval after spawning.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("health monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let summary = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            summary = self.probe_all() => summary,
                        };
                        tracing::info!(
                            probed = summary.probed,
                            succeeded = summary.succeeded,
                            failed = summary.failed,
                            recovered = summary.recovered,
                            "identity health probe round finished"
                        );
                    }
                }
            }
        })
    }
}
