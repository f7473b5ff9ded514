//! Worker pool orchestration for `Dispatcher`.
//!
//! This module owns worker creation and panic capture. `Dispatcher::stop`
//! joins the handles it hands back.

use super::worker::{Worker, WorkerActivityTracker, WorkerShared};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::handler::ResponseHandler;
use futures::FutureExt;
use std::{any::Any, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerPool {
    worker_count: usize,
    activity: Arc<WorkerActivityTracker>,
    workers: Vec<JoinHandle<()>>,
}

pub(crate) struct WorkerLaunch<H: ResponseHandler> {
    pub shared: WorkerShared<H>,
    pub admission: CancellationToken,
    pub abort: CancellationToken,
    pub root_shutdown: CancellationToken,
    pub fatal_handler: Arc<FatalErrorHandler>,
}

impl WorkerPool {
    pub(crate) fn new(worker_count: usize, activity: Arc<WorkerActivityTracker>) -> Self {
        Self {
            worker_count: worker_count.max(1),
            activity,
            workers: Vec::new(),
        }
    }

    pub(crate) fn activity(&self) -> Arc<WorkerActivityTracker> {
        self.activity.clone()
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub(crate) fn launch<H: ResponseHandler>(&mut self, launch: WorkerLaunch<H>) {
        let WorkerLaunch {
            shared,
            admission,
            abort,
            root_shutdown,
            fatal_handler,
        } = launch;

        self.workers.clear();

        for worker_id in 0..self.worker_count {
            let worker = Worker::new(
                worker_id,
                shared.clone(),
                admission.clone(),
                abort.clone(),
                fatal_handler.clone(),
            );

            let worker_shutdown = admission.clone();
            let root_shutdown = root_shutdown.clone();
            let fatal_handler = fatal_handler.clone();

            let handle = tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        // Handler errors were already captured by the worker.
                        tracing::error!(
                            worker = worker_id,
                            error = %err,
                            "worker task exited with error"
                        );
                        worker_shutdown.cancel();
                        root_shutdown.cancel();
                    }
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(
                            worker = worker_id,
                            panic = %panic_msg,
                            "worker task panicked"
                        );
                        fatal_handler.worker_panicked(worker_id, &panic_msg);
                        worker_shutdown.cancel();
                        root_shutdown.cancel();
                    }
                }
            });

            self.workers.push(handle);
        }
    }

    pub(crate) fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.workers)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
