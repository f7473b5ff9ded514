use std::time::Duration;

use crate::support::{
    helpers::{fast_config, init_tracing, wait_for_delivered, wait_until_idle, RecordingHandler},
    mock_site::{MockSite, MockSiteServer},
};
use anyhow::{Context, Result};
use fetchwarden::{
    CrawlRequest, Dispatcher, FetchFailure, FetchResponse, FetchStage, HealthState, IdentitySpec,
    StageContext, StagePipeline,
};
use tokio::time::{sleep, timeout};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetches_every_page_within_domain_limit() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    for idx in 0..50 {
        site.delay(&format!("/listing/{idx}"), Duration::from_millis(20));
    }
    let server = MockSiteServer::start(site.clone()).await?;

    let config = fast_config()
        .worker_count(8)
        .per_domain_concurrency(2)
        .build()?;
    let (handler, state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(config, handler)?;
    dispatcher.submit_all(
        (0..50).map(|idx| CrawlRequest::new("listings", server.page(&format!("/listing/{idx}")))),
    );

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    let state = state.lock().await;
    assert_eq!(state.delivered.len(), 50);
    assert!(state.delivered.iter().all(|page| page.status == 200));
    assert_eq!(state.shutdown_calls, 1);
    assert!(
        site.max_in_flight() <= 2,
        "domain limit exceeded: {} concurrent",
        site.max_in_flight()
    );

    let telemetry = dispatcher.telemetry();
    assert_eq!(telemetry.succeeded, 50);
    assert_eq!(telemetry.dispatched, 50);
    assert_eq!(dispatcher.dead_letter_stats().total, 0);
    let domains = dispatcher.domain_stats();
    let domain = domains.get("127.0.0.1").context("domain tracked")?;
    assert!(domain.max_in_flight <= 2);
    assert_eq!(domain.in_flight, 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_503_is_dead_lettered_after_retry_budget() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    site.status("/unavailable", 503);
    let server = MockSiteServer::start(site.clone()).await?;

    // keep the lone identity selectable while the site keeps failing
    let config = fast_config()
        .max_retries(3)
        .max_consecutive_failures(10)
        .build()?;
    let (handler, state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(config, handler)?;
    dispatcher.submit(CrawlRequest::new("rentals", server.page("/unavailable")));

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    assert_eq!(site.hits("/unavailable"), 4);
    assert!(state.lock().await.delivered.is_empty());

    let stats = dispatcher.dead_letter_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_reason.get("HTTP 503"), Some(&1));
    assert_eq!(stats.by_spider.get("rentals"), Some(&1));
    assert_eq!(stats.recent_items.len(), 1);
    assert_eq!(stats.recent_items[0].attempt_count(), 4);
    assert_eq!(dispatcher.telemetry().retried, 3);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permanent_404_is_dead_lettered_without_retry() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    site.status("/missing", 404);
    let server = MockSiteServer::start(site.clone()).await?;

    let (handler, _state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(fast_config().build()?, handler)?;
    dispatcher.submit(CrawlRequest::new("rentals", server.page("/missing")));

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    assert_eq!(site.hits("/missing"), 1);
    let stats = dispatcher.dead_letter_stats();
    assert_eq!(stats.by_reason.get("HTTP 404"), Some(&1));
    assert_eq!(stats.recent_items[0].attempt_count(), 1);
    assert_eq!(dispatcher.telemetry().retried, 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flaky_page_recovers_within_budget() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    site.flaky("/flaky", 2, 502);
    let server = MockSiteServer::start(site.clone()).await?;

    let (handler, state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(fast_config().build()?, handler)?;
    dispatcher.submit(CrawlRequest::new("rentals", server.page("/flaky")));

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    assert_eq!(site.hits("/flaky"), 3);
    let state = state.lock().await;
    assert_eq!(state.delivered.len(), 1);
    assert_eq!(state.delivered[0].attempts, 3);
    assert_eq!(dispatcher.dead_letter_stats().total, 0);

    let identities = dispatcher.identity_stats();
    let direct = identities
        .per_identity
        .values()
        .next()
        .context("one identity configured")?;
    assert_eq!(direct.failure_count, 2);
    assert_eq!(direct.success_count, 1);
    assert_eq!(direct.consecutive_failures, 0);
    assert_eq!(direct.state, HealthState::Healthy);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_proxy_is_quarantined_and_pages_still_arrive() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    let server = MockSiteServer::start(site.clone()).await?;

    let config = fast_config()
        .identity(IdentitySpec::proxy("http://127.0.0.1:9"))
        .max_consecutive_failures(1)
        .build()?;
    let (handler, state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(config, handler)?;
    dispatcher.submit_all(
        (0..10).map(|idx| CrawlRequest::new("listings", server.page(&format!("/p/{idx}")))),
    );

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    assert_eq!(state.lock().await.delivered.len(), 10);
    assert_eq!(dispatcher.dead_letter_stats().total, 0);

    let identities = dispatcher.identity_stats();
    assert_eq!(identities.total, 2);
    let proxy = identities
        .per_identity
        .values()
        .find(|stats| stats.endpoint != "direct")
        .context("proxy identity listed")?;
    assert_eq!(proxy.state, HealthState::Failed);
    assert!(proxy.failure_count >= 1);
    assert_eq!(identities.failed, 1);
    assert_eq!(identities.healthy, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_is_discarded() -> Result<()> {
    init_tracing();
    let (handler, state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(fast_config().build()?, handler)?;
    dispatcher.submit(CrawlRequest::new("listings", "not a url at all"));

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    assert!(state.lock().await.delivered.is_empty());
    assert_eq!(dispatcher.telemetry().discarded, 1);
    assert_eq!(dispatcher.telemetry().dispatched, 0);
    assert_eq!(dispatcher.dead_letter_stats().total, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_cancels_stragglers_and_keeps_them_queued() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    site.delay("/slow/a", Duration::from_secs(10));
    site.delay("/slow/b", Duration::from_secs(10));
    let server = MockSiteServer::start(site.clone()).await?;

    let config = fast_config()
        .shutdown_grace(Duration::from_millis(100))
        .fetch_timeout(Duration::from_secs(30))
        .build()?;
    let (handler, state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(config, handler)?;
    dispatcher.submit(CrawlRequest::new("listings", server.page("/slow/a")));
    dispatcher.submit(CrawlRequest::new("listings", server.page("/slow/b")));

    dispatcher.start().await?;
    timeout(Duration::from_secs(5), async {
        while dispatcher.in_flight() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("both fetches should start")?;

    timeout(Duration::from_secs(5), dispatcher.stop())
        .await
        .context("stop should honour the grace period")??;

    assert!(state.lock().await.delivered.is_empty());
    assert_eq!(dispatcher.dead_letter_stats().total, 0);
    assert_eq!(dispatcher.telemetry().cancelled, 2);
    assert!(!dispatcher.is_idle());

    let leftovers = dispatcher.drain_frontier();
    assert_eq!(leftovers.len(), 2);
    assert!(leftovers.iter().all(|request| request.attempt_count() == 1));
    assert!(dispatcher.is_idle());

    let identities = dispatcher.identity_stats();
    assert_eq!(identities.healthy, 1);

    // the slow handlers are still sleeping server-side; skip the graceful drain
    drop(server);
    Ok(())
}

struct CaptchaStage;

impl FetchStage for CaptchaStage {
    fn name(&self) -> &'static str {
        "captcha"
    }

    fn on_response(
        &self,
        response: &FetchResponse,
        _ctx: &StageContext<'_>,
    ) -> Result<(), FetchFailure> {
        if String::from_utf8_lossy(&response.body).contains("captcha") {
            return Err(FetchFailure::Rejected {
                stage: self.name(),
                reason: "challenge page".into(),
            });
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vetoing_stage_turns_challenge_pages_into_failures() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    site.body("/wall", "<html>please solve this captcha</html>");
    let server = MockSiteServer::start(site.clone()).await?;

    let stages = StagePipeline::builder().stage(CaptchaStage).build();
    let (handler, state) = RecordingHandler::new();
    let mut dispatcher =
        Dispatcher::new(fast_config().max_retries(1).build()?, handler)?.with_stages(stages);
    assert_eq!(dispatcher.stages().names(), vec!["captcha"]);
    dispatcher.submit(CrawlRequest::new("listings", server.page("/wall")));
    dispatcher.submit(CrawlRequest::new("listings", server.page("/open")));

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    assert_eq!(site.hits("/wall"), 2);
    let state = state.lock().await;
    assert_eq!(state.delivered.len(), 1);
    assert!(state.delivered[0].url.ends_with("/open"));
    assert_eq!(
        dispatcher.dead_letter_stats().by_reason.get("Rejected by captcha"),
        Some(&1)
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn probe_round_revives_failed_identity() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    site.status("/boom", 500);
    let server = MockSiteServer::start(site.clone()).await?;

    let config = fast_config()
        .max_retries(0)
        .max_consecutive_failures(1)
        .probe_url(server.page("/health"))
        .probe_timeout(Duration::from_secs(2))
        .build()?;
    let (handler, state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(config, handler)?;
    dispatcher.submit(CrawlRequest::new("listings", server.page("/boom")));

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    assert_eq!(dispatcher.identity_stats().failed, 1);

    dispatcher.submit(CrawlRequest::new("listings", server.page("/after")));
    sleep(Duration::from_millis(150)).await;
    assert_eq!(site.hits("/after"), 0, "no identity should be selectable");
    assert!(dispatcher.telemetry().identity_exhausted >= 1);

    let summary = dispatcher.probe_identities().await;
    assert_eq!(summary.probed, 1);
    assert_eq!(summary.recovered, 1);
    assert_eq!(site.hits("/health"), 1);
    let identities = dispatcher.identity_stats();
    assert_eq!(identities.healthy, 1);
    assert_eq!(
        identities
            .per_identity
            .values()
            .map(|stats| stats.consecutive_failures)
            .sum::<u32>(),
        0
    );

    wait_for_delivered(&state, 1, IDLE_TIMEOUT).await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;
    assert_eq!(state.lock().await.delivered[0].attempts, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pinned_user_agents_reach_the_site() -> Result<()> {
    init_tracing();
    let site = MockSite::new();
    let server = MockSiteServer::start(site.clone()).await?;

    let config = fast_config()
        .identity(IdentitySpec::direct().with_user_agent("agent-b/2.0"))
        .build()?;
    let (handler, _state) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::new(config, handler)?;
    dispatcher.submit_all(
        (0..12).map(|idx| CrawlRequest::new("listings", server.page(&format!("/ua/{idx}")))),
    );

    dispatcher.start().await?;
    wait_until_idle(&dispatcher, IDLE_TIMEOUT).await?;
    dispatcher.stop().await?;

    let agents = site.user_agents();
    assert_eq!(agents.len(), 12);
    assert!(agents.iter().any(|agent| agent == "agent-b/2.0"));
    assert!(agents.iter().any(|agent| agent != "agent-b/2.0"));

    server.shutdown().await;
    Ok(())
}
