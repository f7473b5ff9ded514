use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
struct RouteScript {
    status: u16,
    delay: Duration,
    /// Requests answered with `failure_status` before `status` takes over.
    failures_before_success: u64,
    failure_status: u16,
    body: Option<String>,
}

impl Default for RouteScript {
    fn default() -> Self {
        Self {
            status: 200,
            delay: Duration::ZERO,
            failures_before_success: 0,
            failure_status: 503,
            body: None,
        }
    }
}

#[derive(Default)]
struct SiteState {
    routes: RwLock<HashMap<String, RouteScript>>,
    hits: Mutex<HashMap<String, u64>>,
    user_agents: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Scripted HTTP site: per-path statuses, delays and flakiness, plus hit
/// counters and an in-flight high-water mark.
#[derive(Clone, Default)]
pub struct MockSite {
    inner: Arc<SiteState>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, path: &str, update: impl FnOnce(&mut RouteScript)) {
        let mut routes = self.inner.routes.write().expect("mock site poisoned");
        update(routes.entry(path.to_owned()).or_default());
    }

    pub fn status(&self, path: &str, status: u16) {
        self.script(path, |route| route.status = status);
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.script(path, |route| route.delay = delay);
    }

    /// The first `failures` requests to `path` answer `failure_status`.
    pub fn flaky(&self, path: &str, failures: u64, failure_status: u16) {
        self.script(path, |route| {
            route.failures_before_success = failures;
            route.failure_status = failure_status;
        });
    }

    pub fn body(&self, path: &str, body: impl Into<String>) {
        let body = body.into();
        self.script(path, |route| route.body = Some(body));
    }

    pub fn hits(&self, path: &str) -> u64 {
        self.inner
            .hits
            .lock()
            .expect("mock site poisoned")
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_hits(&self) -> u64 {
        self.inner
            .hits
            .lock()
            .expect("mock site poisoned")
            .values()
            .sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.inner
            .user_agents
            .lock()
            .expect("mock site poisoned")
            .clone()
    }

    fn enter(&self) -> InFlight {
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight {
            state: self.inner.clone(),
        }
    }
}

struct InFlight {
    state: Arc<SiteState>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockSiteServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockSiteServer {
    pub async fn start(site: MockSite) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock site listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let site = site.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(site.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock site server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn page(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(site: MockSite, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_owned();
    if let Some(agent) = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        site.inner
            .user_agents
            .lock()
            .expect("mock site poisoned")
            .push(agent.to_owned());
    }

    let _in_flight = site.enter();
    let hit = {
        let mut hits = site.inner.hits.lock().expect("mock site poisoned");
        let counter = hits.entry(path.clone()).or_insert(0);
        *counter += 1;
        *counter
    };
    let script = site
        .inner
        .routes
        .read()
        .expect("mock site poisoned")
        .get(&path)
        .cloned()
        .unwrap_or_default();

    if !script.delay.is_zero() {
        tokio::time::sleep(script.delay).await;
    }

    let status = if hit <= script.failures_before_success {
        script.failure_status
    } else {
        script.status
    };
    let body = script
        .body
        .unwrap_or_else(|| format!("<html><body>{path}</body></html>"));

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/html"),
    );
    Ok(response)
}
