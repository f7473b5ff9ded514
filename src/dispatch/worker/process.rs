use crate::dispatch::frontier::{Admission, Frontier};
use crate::dispatch::request::CrawlRequest;
use crate::dispatch::throttle::{DomainGates, DomainPermit};
use crate::identity::{EgressIdentity, FingerprintGenerator, IdentityPool};
use crate::net::{Fetcher, FetchFailure, PreparedRequest, StageContext, StagePipeline};
use crate::retry::RetryGovernor;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::handler::{Delivery, HandlerError, ResponseHandler};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::shared::{WorkerActivityTracker, WorkerShared};
use super::types::{AttemptResult, DispatchOutcome};

pub(crate) struct Worker<H: ResponseHandler> {
    pub id: usize,
    pub(super) frontier: Arc<Frontier>,
    pub(super) gates: DomainGates,
    pub(super) pool: Arc<IdentityPool>,
    pub(super) fingerprints: Arc<FingerprintGenerator>,
    pub(super) fetcher: Arc<dyn Fetcher>,
    pub(super) stages: StagePipeline,
    pub(super) governor: Arc<RetryGovernor>,
    pub(super) handler: Arc<H>,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) activity: Arc<WorkerActivityTracker>,
    pub(super) fetch_timeout: Duration,
    /// Cancelled when the worker should stop taking new requests.
    pub(super) admission: CancellationToken,
    /// Cancelled when in-flight fetches must be abandoned.
    pub(super) abort: CancellationToken,
    pub(super) fatal_handler: Arc<FatalErrorHandler>,
}

impl<H: ResponseHandler> Worker<H> {
    pub(crate) fn new(
        id: usize,
        shared: WorkerShared<H>,
        admission: CancellationToken,
        abort: CancellationToken,
        fatal_handler: Arc<FatalErrorHandler>,
    ) -> Self {
        let WorkerShared {
            frontier,
            gates,
            pool,
            fingerprints,
            fetcher,
            stages,
            governor,
            handler,
            telemetry,
            activity,
            fetch_timeout,
        } = shared;

        Self {
            id,
            frontier,
            gates,
            pool,
            fingerprints,
            fetcher,
            stages,
            governor,
            handler,
            telemetry,
            activity,
            fetch_timeout,
            admission,
            abort,
            fatal_handler,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    pub(crate) async fn run(self) -> Result<()> {
        tracing::info!(worker = self.id, "worker task started");

        loop {
            let gates = self.gates.clone();
            let activity = self.activity.clone();
            let next = self
                .frontier
                .pop_admissible(&self.admission, |request| {
                    match gates.try_admit(request.domain()) {
                        Ok(permit) => Admission::Admit((permit, activity.enter())),
                        Err(retry_at) => Admission::Defer(retry_at),
                    }
                })
                .await;

            let Some((request, (permit, _in_flight))) = next else {
                break;
            };

            if let Err(err) = self.dispatch(request, permit).await {
                return Err(self.fatal_handler.handler_failed(err));
            }
        }

        tracing::info!(worker = self.id, "worker task stopped");
        Ok(())
    }

    /// Runs one attempt for `request` while holding its domain slot. Only a
    /// response handler error escapes; every fetch failure is settled here.
    pub(crate) async fn dispatch(
        &self,
        mut request: CrawlRequest,
        permit: DomainPermit,
    ) -> Result<DispatchOutcome, HandlerError> {
        let mut prepared = match PreparedRequest::from_request(&request) {
            Ok(prepared) => prepared,
            Err(failure) => {
                drop(permit);
                return Ok(DispatchOutcome::Failed(
                    self.governor.settle(request, &failure),
                ));
            }
        };

        let identity = match self.pool.select() {
            Ok(identity) => identity,
            Err(err) => {
                drop(permit);
                tracing::debug!(worker = self.id, error = %err, "identity selection failed");
                self.governor.defer_for_identity(request);
                return Ok(DispatchOutcome::Deferred);
            }
        };

        request.begin_attempt(identity.id());
        self.telemetry.record_dispatched();
        let fingerprint = self.fingerprints.generate(&identity);

        let attempt = {
            let ctx = StageContext {
                request: &request,
                identity: &identity,
                fingerprint: &fingerprint,
            };
            self.stages.before_request(&mut prepared, &ctx);
            let attempt = self.attempt(prepared, &identity, &ctx).await;
            if let AttemptResult::Failed { failure, .. } = &attempt {
                self.stages.on_error(failure, &ctx);
            }
            attempt
        };

        match attempt {
            AttemptResult::Fetched(response) => {
                self.pool
                    .record_outcome(identity.id(), true, response.latency);
                self.gates
                    .observe(request.domain(), response.latency, true);
                drop(permit);
                self.telemetry.record_succeeded();

                let delivery = Delivery {
                    request,
                    response,
                    identity: identity.id(),
                };
                let outcome = self.handler.handle(delivery).await;
                self.frontier.settle();
                outcome.map(|()| DispatchOutcome::Delivered)
            }
            AttemptResult::Failed {
                failure,
                response_latency,
            } => {
                if failure.charges_identity() {
                    self.pool.record_outcome(
                        identity.id(),
                        false,
                        response_latency.unwrap_or_default(),
                    );
                }
                if let Some(latency) = response_latency {
                    self.gates.observe(request.domain(), latency, false);
                }
                drop(permit);
                self.telemetry.record_failed_attempt();
                if failure == FetchFailure::Cancelled {
                    self.telemetry.record_cancelled();
                }
                Ok(DispatchOutcome::Failed(
                    self.governor.settle(request, &failure),
                ))
            }
        }
    }

    async fn attempt(
        &self,
        prepared: PreparedRequest,
        identity: &EgressIdentity,
        ctx: &StageContext<'_>,
    ) -> AttemptResult {
        let started = Instant::now();
        let fetched = tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(FetchFailure::Cancelled),
            result = time::timeout(
                self.fetch_timeout,
                self.fetcher.fetch(prepared, identity, self.fetch_timeout),
            ) => result.unwrap_or(Err(FetchFailure::Timeout)),
        };

        let response = match fetched {
            Ok(response) => response,
            Err(failure) => {
                tracing::debug!(
                    worker = self.id,
                    identity = %identity.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %failure,
                    "fetch attempt failed"
                );
                return AttemptResult::Failed {
                    failure,
                    response_latency: None,
                };
            }
        };

        let verdict = if response.is_success() {
            self.stages.on_response(&response, ctx)
        } else {
            Err(FetchFailure::HttpStatus {
                status: response.status,
            })
        };

        match verdict {
            Ok(()) => AttemptResult::Fetched(response),
            Err(failure) => AttemptResult::Failed {
                failure,
                response_latency: Some(response.latency),
            },
        }
    }
}
