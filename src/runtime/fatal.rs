//! Abort latch for one dispatch run. The first unrecoverable failure (a
//! response handler error or a worker panic) is recorded, both shutdown tokens
//! are cancelled, and `Dispatcher::stop` reports the recorded error.

use crate::runtime::handler::{HandlerError, HandlerStage};
use anyhow::{anyhow, Error as AnyError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCause {
    Handler(HandlerStage),
    WorkerPanic { worker: usize },
}

impl fmt::Display for FatalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalCause::Handler(stage) => write!(f, "response handler failed in {stage:?}"),
            FatalCause::WorkerPanic { worker } => write!(f, "worker {worker} panicked"),
        }
    }
}

#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<AbortLatch>,
}

struct AbortLatch {
    tripped: AtomicBool,
    root_shutdown: CancellationToken,
    run_shutdown: CancellationToken,
    first: Mutex<Option<AnyError>>,
}

impl FatalErrorHandler {
    pub fn new(root_shutdown: CancellationToken, run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(AbortLatch {
                tripped: AtomicBool::new(false),
                root_shutdown,
                run_shutdown,
                first: Mutex::new(None),
            }),
        }
    }

    /// Aborts the run on a handler failure. The returned summary is what the
    /// failing worker exits with; the full error stays with the latch.
    pub fn handler_failed(&self, error: HandlerError) -> AnyError {
        let summary = anyhow!("{error}");
        self.trip(FatalCause::Handler(error.stage()), error.into());
        summary
    }

    pub fn worker_panicked(&self, worker: usize, message: &str) {
        self.trip(
            FatalCause::WorkerPanic { worker },
            anyhow!("worker {worker} panicked: {message}"),
        );
    }

    fn trip(&self, cause: FatalCause, error: AnyError) {
        if self.inner.tripped.swap(true, Ordering::SeqCst) {
            tracing::debug!(%cause, error = %error, "run already aborting; later failure dropped");
            return;
        }

        tracing::error!(%cause, error = %error, "aborting dispatch run");
        *self.inner.first.lock().expect("fatal error mutex poisoned") =
            Some(error.context(cause.to_string()));

        self.inner.run_shutdown.cancel();
        self.inner.root_shutdown.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    /// Hands over the recorded error. The latch stays tripped.
    pub(crate) fn take_error(&self) -> Option<AnyError> {
        self.inner
            .first
            .lock()
            .expect("fatal error mutex poisoned")
            .take()
    }
}
