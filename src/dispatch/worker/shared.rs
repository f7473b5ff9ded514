use crate::dispatch::frontier::Frontier;
use crate::dispatch::throttle::DomainGates;
use crate::identity::{FingerprintGenerator, IdentityPool};
use crate::net::{Fetcher, StagePipeline};
use crate::retry::RetryGovernor;
use crate::runtime::handler::ResponseHandler;
use crate::runtime::telemetry::Telemetry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub(crate) struct WorkerShared<H: ResponseHandler> {
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
}

pub(crate) struct WorkerSharedParams<H: ResponseHandler> {
    pub frontier: Arc<Frontier>,
    pub gates: DomainGates,
    pub pool: Arc<IdentityPool>,
    pub fingerprints: Arc<FingerprintGenerator>,
    pub fetcher: Arc<dyn Fetcher>,
    pub stages: StagePipeline,
    pub governor: Arc<RetryGovernor>,
    pub handler: Arc<H>,
    pub telemetry: Arc<Telemetry>,
    pub activity: Arc<WorkerActivityTracker>,
    pub fetch_timeout: Duration,
}

impl<H: ResponseHandler> WorkerShared<H> {
    pub(crate) fn new(params: WorkerSharedParams<H>) -> Self {
        Self {
            frontier: params.frontier,
            gates: params.gates,
            pool: params.pool,
            fingerprints: params.fingerprints,
            fetcher: params.fetcher,
            stages: params.stages,
            governor: params.governor,
            handler: params.handler,
            telemetry: params.telemetry,
            activity: params.activity,
            fetch_timeout: params.fetch_timeout,
        }
    }
}

impl<H: ResponseHandler> Clone for WorkerShared<H> {
    fn clone(&self) -> Self {
        Self {
            frontier: Arc::clone(&self.frontier),
            gates: self.gates.clone(),
            pool: Arc::clone(&self.pool),
            fingerprints: Arc::clone(&self.fingerprints),
            fetcher: Arc::clone(&self.fetcher),
            stages: self.stages.clone(),
            governor: Arc::clone(&self.governor),
            handler: Arc::clone(&self.handler),
            telemetry: Arc::clone(&self.telemetry),
            activity: Arc::clone(&self.activity),
            fetch_timeout: self.fetch_timeout,
        }
    }
}

/// Counts requests currently in flight across every worker.
#[derive(Debug, Default)]
pub struct WorkerActivityTracker {
    in_flight: AtomicUsize,
    notify: Notify,
}

impl WorkerActivityTracker {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn enter(self: &Arc<Self>) -> WorkerActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        WorkerActivityGuard {
            tracker: Arc::clone(self),
            active: true,
        }
    }

    pub fn active(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_until_idle(&self) {
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }

            let notified = self.notify.notified();

            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

pub struct WorkerActivityGuard {
    tracker: Arc<WorkerActivityTracker>,
    active: bool,
}

impl Drop for WorkerActivityGuard {
    fn drop(&mut self) {
        if self.active {
            self.tracker.release();
            self.active = false;
        }
    }
}
