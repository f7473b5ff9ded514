//! Lifecycle orchestration for `Dispatcher`.

use super::frontier::Frontier;
use super::worker::WorkerActivityTracker;
use crate::identity::{HealthMonitor, IdentityPool};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, MetricsSources, Telemetry};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
    metrics_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub frontier: Arc<Frontier>,
    pub pool: Arc<IdentityPool>,
    pub activity: Arc<WorkerActivityTracker>,
    pub metrics_interval: Duration,
    pub monitor: Arc<HealthMonitor>,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> Self {
        let LifecycleSpawnParams {
            shutdown_root,
            telemetry,
            frontier,
            pool,
            activity,
            metrics_interval,
            monitor,
        } = params;

        let run_token = shutdown_root.child_token();
        let fatal_handler = Arc::new(FatalErrorHandler::new(
            shutdown_root.clone(),
            run_token.clone(),
        ));
        let metrics_handle = telemetry::spawn_metrics_reporter(
            MetricsSources {
                telemetry,
                frontier,
                pool,
                activity,
            },
            run_token.clone(),
            metrics_interval,
        );
        let monitor_handle = monitor.spawn(run_token.clone());

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
            monitor_handle: Some(monitor_handle),
        }
    }

    pub(crate) fn fatal_handler(&self) -> Arc<FatalErrorHandler> {
        self.fatal_handler.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.take_error()
    }

    pub(crate) async fn shutdown(mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        if let Some(handle) = self.monitor_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "health monitor task panicked");
            }
        }
    }
}
