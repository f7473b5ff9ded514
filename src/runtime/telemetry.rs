use crate::dispatch::frontier::Frontier;
use crate::dispatch::worker::WorkerActivityTracker;
use crate::identity::IdentityPool;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Dispatch counters shared by every worker.
#[derive(Default, Debug)]
pub struct Telemetry {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    identity_exhausted: AtomicU64,
    cancelled: AtomicU64,
}

impl Telemetry {
    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_identity_exhausted(&self) {
        self.identity_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            identity_exhausted: self.identity_exhausted.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn identity_exhausted(&self) -> u64 {
        self.identity_exhausted.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed_attempts: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
    pub identity_exhausted: u64,
    pub cancelled: u64,
}

/// Handles the metrics reporter reads on every tick.
pub(crate) struct MetricsSources {
    pub telemetry: Arc<Telemetry>,
    pub frontier: Arc<Frontier>,
    pub pool: Arc<IdentityPool>,
    pub activity: Arc<WorkerActivityTracker>,
}

/// Spawns a background task that periodically logs throughput, frontier depth,
/// in-flight fetches and identity health.
pub(crate) fn spawn_metrics_reporter(
    sources: MetricsSources,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let MetricsSources {
            telemetry,
            frontier,
            pool,
            activity,
        } = sources;
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "fetchwarden::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let delivered = current.succeeded.saturating_sub(last_snapshot.succeeded);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        delivered as f64 / elapsed
                    };
                    let identities = pool.stats();

                    tracing::info!(
                        target: "fetchwarden::metrics",
                        throughput = format!("{throughput:.2}"),
                        dispatched = current.dispatched,
                        succeeded = current.succeeded,
                        retried = current.retried,
                        dead_lettered = current.dead_lettered,
                        discarded = current.discarded,
                        identity_exhausted = current.identity_exhausted,
                        frontier = frontier.len(),
                        in_flight = activity.active(),
                        healthy = identities.healthy,
                        degraded = identities.degraded,
                        failed = identities.failed,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
