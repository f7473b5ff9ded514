//! Request dispatch orchestration.
//!
//! `Dispatcher` composes smaller modules so each concern is owned by the
//! component that knows it best:
//! - `frontier` orders pending requests by eligibility time.
//! - `throttle` gates admission per domain and paces it from latency.
//! - `worker_pool` spawns the fetch workers and captures their panics.
//! - `lifecycle` wires run-scoped cancellation, the metrics reporter, the
//!   health monitor, and fatal error propagation.
//!
//! Callers interact with the single `Dispatcher` API; identity health,
//! retry policy and dead letters live in their own top-level modules.

use super::frontier::Frontier;
use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use super::request::CrawlRequest;
use super::throttle::{DomainGates, DomainSnapshot};
use super::worker::{WorkerActivityTracker, WorkerShared, WorkerSharedParams};
use super::worker_pool::{WorkerLaunch, WorkerPool};
use crate::deadletter::{DeadLetterSink, DeadLetterStats};
use crate::identity::{
    FingerprintGenerator, HealthMonitor, IdentityPool, IdentityPoolStats, ProbeSummary,
};
use crate::net::{Fetcher, HttpFetcher, Prober, StagePipeline};
use crate::retry::{BackoffSchedule, FailureClassifier, RetryGovernor, RetryGovernorParams};
use crate::runtime::config::DispatcherConfig;
use crate::runtime::handler::ResponseHandler;
use crate::runtime::telemetry::{Telemetry, TelemetrySnapshot};
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;

struct RunState {
    lifecycle: LifecycleHandles,
    abort: CancellationToken,
}

pub struct Dispatcher<H: ResponseHandler> {
    config: DispatcherConfig,
    handler: Arc<H>,
    frontier: Arc<Frontier>,
    gates: DomainGates,
    pool: Arc<IdentityPool>,
    fingerprints: Arc<FingerprintGenerator>,
    fetcher: Arc<dyn Fetcher>,
    prober: Arc<dyn Prober>,
    stages: StagePipeline,
    sink: Arc<DeadLetterSink>,
    governor: Arc<RetryGovernor>,
    telemetry: Arc<Telemetry>,
    worker_pool: WorkerPool,
    shutdown_root: CancellationToken,
    run: Option<RunState>,
}

impl<H: ResponseHandler> Dispatcher<H> {
    /// Creates a dispatcher using the reqwest transport for fetches and probes.
    pub fn new(config: DispatcherConfig, handler: H) -> Result<Self> {
        Self::with_cancellation_token(config, handler, CancellationToken::new())
    }

    /// Creates a dispatcher whose runs derive their cancellation from `shutdown_token`.
    pub fn with_cancellation_token(
        config: DispatcherConfig,
        handler: H,
        shutdown_token: CancellationToken,
    ) -> Result<Self> {
        let transport = Arc::new(HttpFetcher::new().context("failed to build HTTP transport")?);
        let frontier = Arc::new(Frontier::new());
        let telemetry = Arc::new(Telemetry::default());
        let sink = Arc::new(DeadLetterSink::new(config.dead_letter_capacity()));
        let pool = Arc::new(IdentityPool::new(
            config.identities(),
            config.max_consecutive_failures(),
        ));
        let gates = DomainGates::new(
            config.per_domain_concurrency(),
            config.throttle(),
            frontier.clone(),
        );
        let governor = Arc::new(RetryGovernor::new(RetryGovernorParams {
            classifier: FailureClassifier::new(config.retryable_http_codes().iter().copied()),
            backoff: BackoffSchedule::new(config.backoff_base(), config.max_delay()),
            max_retries: config.max_retries(),
            identity_exhausted_delay: config.identity_exhausted_delay(),
            frontier: frontier.clone(),
            sink: sink.clone(),
            telemetry: telemetry.clone(),
        }));
        let worker_pool = WorkerPool::new(
            config.worker_count(),
            Arc::new(WorkerActivityTracker::new()),
        );

        Ok(Self {
            config,
            handler: Arc::new(handler),
            frontier,
            gates,
            pool,
            fingerprints: Arc::new(FingerprintGenerator::default()),
            fetcher: transport.clone(),
            prober: transport,
            stages: StagePipeline::default(),
            sink,
            governor,
            telemetry,
            worker_pool,
            shutdown_root: shutdown_token,
            run: None,
        })
    }

    /// Swaps the fetch and probe transports. Must be called before `start`.
    pub fn with_transport(mut self, fetcher: Arc<dyn Fetcher>, prober: Arc<dyn Prober>) -> Self {
        self.fetcher = fetcher;
        self.prober = prober;
        self
    }

    /// Replaces the default fingerprint/trace stage pipeline.
    pub fn with_stages(mut self, stages: StagePipeline) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_fingerprints(mut self, fingerprints: FingerprintGenerator) -> Self {
        self.fingerprints = Arc::new(fingerprints);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    pub fn stages(&self) -> &StagePipeline {
        &self.stages
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Queues a new request. Accepted whether or not the dispatcher is running.
    pub fn submit(&self, request: CrawlRequest) {
        self.frontier.submit(request);
    }

    pub fn submit_all(&self, requests: impl IntoIterator<Item = CrawlRequest>) {
        for request in requests {
            self.frontier.submit(request);
        }
    }

    /// True when every submitted request has been delivered, dead-lettered or discarded.
    pub fn is_idle(&self) -> bool {
        self.frontier.outstanding() == 0
    }

    pub fn identity_stats(&self) -> IdentityPoolStats {
        self.pool.stats()
    }

    pub fn dead_letter_stats(&self) -> DeadLetterStats {
        self.sink.stats()
    }

    /// Per-domain in-flight counts, high-water marks and pacing delays.
    pub fn domain_stats(&self) -> BTreeMap<String, DomainSnapshot> {
        self.gates.snapshot()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// In-flight fetches right now.
    pub fn in_flight(&self) -> usize {
        self.worker_pool.activity().active()
    }

    /// Hands back every queued request. Intended for use after `stop`.
    pub fn drain_frontier(&self) -> Vec<CrawlRequest> {
        self.frontier.drain()
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.pool.clone(),
            self.prober.clone(),
            self.config.probe_url(),
            self.config.probe_timeout(),
            self.config.health_check_interval(),
        )
    }

    /// Runs one probe round immediately, outside the periodic schedule.
    pub async fn probe_identities(&self) -> ProbeSummary {
        self.health_monitor().probe_all().await
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the dispatcher is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            self.run.is_none(),
            "shutdown token should not change while the dispatcher is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Spawns the workers and background tasks.
    ///
    /// Returns an error if the dispatcher is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.run.is_some() {
            bail!("dispatcher already running");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "DispatcherConfig should have been validated at construction time"
        );

        tracing::info!(
            workers = self.worker_pool.worker_count(),
            identities = self.pool.len(),
            per_domain = self.config.per_domain_concurrency(),
            queued = self.frontier.len(),
            stages = ?self.stages.names(),
            "starting dispatcher"
        );

        let activity = self.worker_pool.activity();
        let lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &self.shutdown_root,
            telemetry: self.telemetry.clone(),
            frontier: self.frontier.clone(),
            pool: self.pool.clone(),
            activity: activity.clone(),
            metrics_interval: self.config.metrics_interval(),
            monitor: Arc::new(self.health_monitor()),
        });
        let abort = CancellationToken::new();

        self.worker_pool.launch(WorkerLaunch {
            shared: WorkerShared::new(WorkerSharedParams {
                frontier: self.frontier.clone(),
                gates: self.gates.clone(),
                pool: self.pool.clone(),
                fingerprints: self.fingerprints.clone(),
                fetcher: self.fetcher.clone(),
                stages: self.stages.clone(),
                governor: self.governor.clone(),
                handler: self.handler.clone(),
                telemetry: self.telemetry.clone(),
                activity,
                fetch_timeout: self.config.fetch_timeout(),
            }),
            admission: lifecycle.run_token.clone(),
            abort: abort.clone(),
            root_shutdown: self.shutdown_root.clone(),
            fatal_handler: lifecycle.fatal_handler(),
        });

        self.run = Some(RunState { lifecycle, abort });
        Ok(())
    }

    /// Stops admitting requests, gives in-flight fetches the configured grace
    /// period, cancels whatever is left, then joins every task. Cancelled
    /// fetches go back to the frontier. Returns the fatal handler error, if
    /// one ended the run.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };

        tracing::info!("stopping dispatcher");
        self.frontier.close_admission(&run.lifecycle.run_token);

        let activity = self.worker_pool.activity();
        let grace = self.config.shutdown_grace();
        if time::timeout(grace, activity.wait_until_idle()).await.is_err() {
            tracing::warn!(
                in_flight = activity.active(),
                grace_ms = grace.as_millis() as u64,
                "shutdown grace elapsed; cancelling in-flight fetches"
            );
            run.abort.cancel();
        }

        let results = join_all(self.worker_pool.take_handles()).await;
        for (idx, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                tracing::warn!(worker = idx, error = %err, "worker task terminated unexpectedly");
            }
        }
        tracing::debug!("dispatcher stop: worker tasks joined");

        let lifecycle_error = run.lifecycle.error();
        run.lifecycle.shutdown().await;

        self.handler
            .shutdown()
            .await
            .context("failed to shutdown response handler")?;

        tracing::info!(
            queued = self.frontier.len(),
            outstanding = self.frontier.outstanding(),
            "dispatcher stopped"
        );

        if let Some(err) = lifecycle_error {
            return Err(err).context("dispatch run aborted");
        }

        Ok(())
    }
}
