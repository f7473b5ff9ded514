use crate::{Dispatcher, DispatcherConfig, ResponseHandler};
use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the dispatcher lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner<H: ResponseHandler> {
    dispatcher: Dispatcher<H>,
    shutdown: CancellationToken,
    started: bool,
}

impl<H: ResponseHandler> Runner<H> {
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the entire dispatcher (workers, metrics reporter, health monitor).
    pub fn new(config: DispatcherConfig, handler: H) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::with_cancellation_token(config, handler, shutdown.clone())?;
        Ok(Self {
            dispatcher,
            shutdown,
            started: false,
        })
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher<H> {
        &self.dispatcher
    }

    /// Mutable access for wiring done before `start` (transport, stages).
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<H> {
        &mut self.dispatcher
    }

    /// Starts the underlying dispatcher.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.dispatcher.start().await?;
        self.started = true;
        Ok(())
    }

    /// Stops the dispatcher gracefully by cancelling the root token and delegating to it.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        let result = self.dispatcher.stop().await;
        self.started = false;
        self.reinitialize_shutdown_token();
        result
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.dispatcher.replace_shutdown_root(self.shutdown.clone());
    }
}
