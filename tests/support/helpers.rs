use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use fetchwarden::{
    Delivery, DispatcherConfigBuilder, Dispatcher, DispatcherConfig, HandlerError, HandlerFuture,
    HandlerStage, ResponseHandler,
};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Builder preset for tests: direct egress, no pacing, millisecond retries,
/// and background intervals long enough to stay out of the way.
pub fn fast_config() -> DispatcherConfigBuilder {
    DispatcherConfig::builder()
        .direct()
        .auto_throttle(false)
        .max_delay(Duration::from_millis(20))
        .identity_exhausted_delay(Duration::from_millis(50))
        .fetch_timeout(Duration::from_secs(5))
        .shutdown_grace(Duration::from_secs(2))
        .health_check_interval(Duration::from_secs(3600))
        .metrics_interval(Duration::from_secs(3600))
}

#[derive(Debug, Clone)]
pub struct DeliveredPage {
    pub url: String,
    pub status: u16,
    pub attempts: u32,
    pub body: String,
}

#[derive(Default)]
pub struct HandlerState {
    pub delivered: Vec<DeliveredPage>,
    pub shutdown_calls: usize,
}

/// Records every delivery; optionally fails on URLs containing a marker.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    state: Arc<Mutex<HandlerState>>,
    fail_on: Option<&'static str>,
}

impl RecordingHandler {
    pub fn new() -> (Self, Arc<Mutex<HandlerState>>) {
        let handler = Self::default();
        let state = handler.state.clone();
        (handler, state)
    }

    pub fn failing_on(marker: &'static str) -> (Self, Arc<Mutex<HandlerState>>) {
        let (mut handler, state) = Self::new();
        handler.fail_on = Some(marker);
        (handler, state)
    }
}

impl ResponseHandler for RecordingHandler {
    fn handle<'a>(&'a self, delivery: Delivery) -> HandlerFuture<'a> {
        Box::pin(async move {
            let url = delivery.request.url().to_owned();
            if let Some(marker) = self.fail_on {
                if url.contains(marker) {
                    return Err(HandlerError::new(
                        HandlerStage::Handle,
                        anyhow::anyhow!("extractor choked on {url}"),
                    ));
                }
            }
            let mut state = self.state.lock().await;
            state.delivered.push(DeliveredPage {
                url,
                status: delivery.response.status,
                attempts: delivery.request.attempt_count(),
                body: String::from_utf8_lossy(&delivery.response.body).into_owned(),
            });
            Ok(())
        })
    }

    fn shutdown<'a>(&'a self) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.state.lock().await.shutdown_calls += 1;
            Ok(())
        })
    }
}

pub async fn wait_until_idle<H: ResponseHandler>(
    dispatcher: &Dispatcher<H>,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if dispatcher.is_idle() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!(
                "dispatcher did not go idle within {:?} (queued: {}, outstanding: {})",
                timeout,
                dispatcher.frontier().len(),
                dispatcher.frontier().outstanding()
            );
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_delivered(
    state: &Arc<Mutex<HandlerState>>,
    target: usize,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        {
            let guard = state.lock().await;
            if guard.delivered.len() >= target {
                return Ok(());
            }
        }

        if start.elapsed() > timeout {
            bail!("handler did not record {target} pages within {:?}", timeout);
        }

        sleep(Duration::from_millis(20)).await;
    }
}
