use std::time::Duration;

use crate::support::{
    helpers::{fast_config, init_tracing, wait_for_delivered, wait_until_idle, RecordingHandler},
    mock_site::{MockSite, MockSiteServer},
};
use anyhow::{Context, Result};
use fetchwarden::{CrawlRequest, Dispatcher, Runner};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_failure_aborts_dispatch() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    let server = MockSiteServer::start(site.clone()).await?;

    let (handler, _state) = RecordingHandler::failing_on("/poison");
    let mut dispatcher = Dispatcher::new(fast_config().build()?, handler)?;
    dispatcher.submit(CrawlRequest::new("listings", server.page("/poison")));
    dispatcher.start().await?;

    timeout(Duration::from_secs(5), async {
        while site.hits("/poison") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("poisoned page should be fetched")?;

    let err = dispatcher
        .stop()
        .await
        .expect_err("handler failure should surface from stop");
    let message = format!("{err:#}");
    assert!(
        message.contains("dispatch run aborted") && message.contains("extractor choked"),
        "expected handler failure to abort the run, got {message}"
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_exits_on_handler_failure() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    let server = MockSiteServer::start(site.clone()).await?;

    let (handler, _state) = RecordingHandler::failing_on("/poison");
    let mut runner = Runner::new(fast_config().build()?, handler)?;
    runner
        .dispatcher()
        .submit(CrawlRequest::new("listings", server.page("/poison")));

    let outcome = timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should stop after handler failure")?;

    let err = outcome.expect_err("handler failure should abort runner");
    let message = format!("{err:#}");
    assert!(
        message.contains("extractor choked"),
        "runner did not propagate handler failure, got {message}"
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_stops_on_external_cancellation_and_restarts() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    let server = MockSiteServer::start(site.clone()).await?;

    let (handler, state) = RecordingHandler::new();
    let mut runner = Runner::new(fast_config().build()?, handler)?;
    runner
        .dispatcher()
        .submit(CrawlRequest::new("listings", server.page("/first")));

    runner.start().await?;
    wait_for_delivered(&state, 1, Duration::from_secs(5)).await?;

    let token = runner.cancellation_token();
    token.cancel();
    runner.stop().await?;
    assert!(!runner.dispatcher().is_running());
    assert!(
        !runner.cancellation_token().is_cancelled(),
        "stop should install a fresh root token"
    );

    runner
        .dispatcher()
        .submit(CrawlRequest::new("listings", server.page("/second")));
    runner.start().await?;
    wait_until_idle(runner.dispatcher(), Duration::from_secs(5)).await?;
    runner.stop().await?;

    let state = state.lock().await;
    assert_eq!(state.delivered.len(), 2);
    assert_eq!(state.shutdown_calls, 2);
    assert_eq!(site.hits("/second"), 1);

    server.shutdown().await;
    Ok(())
}
