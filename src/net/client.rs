//! HTTP transport behind the dispatcher. `Fetcher` and `Prober` are the seams
//! the dispatcher and health monitor depend on; `HttpFetcher` is the reqwest
//! implementation with one pooled client per egress proxy.

use crate::identity::EgressIdentity;
use crate::net::options::FetchClientOptions;
use crate::net::stages::{FetchResponse, PreparedRequest};
use crate::net::FetchFailure;
use anyhow::Result;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method, Proxy};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub trait Fetcher: Send + Sync {
    /// Performs one attempt. Any HTTP status is returned as a response; only
    /// transport problems surface as errors.
    fn fetch<'a>(
        &'a self,
        request: PreparedRequest,
        identity: &'a EgressIdentity,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchFailure>>;
}

pub trait Prober: Send + Sync {
    /// Lightweight reachability check through `identity`. Returns the observed latency.
    fn probe<'a>(
        &'a self,
        identity: &'a EgressIdentity,
        target: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Duration, FetchFailure>>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    options: FetchClientOptions,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Self::with_options(FetchClientOptions::default())
    }

    pub fn with_options(options: FetchClientOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, identity: &EgressIdentity) -> Result<Client, FetchFailure> {
        let key = identity.proxy().map(str::to_owned);
        let mut clients = self.clients.lock().expect("client cache mutex poisoned");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_client(&self.options, identity.proxy())?;
        tracing::debug!(
            identity = %identity.id(),
            endpoint = identity.endpoint(),
            "built HTTP client for egress identity"
        );
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn execute(
        &self,
        request: PreparedRequest,
        identity: &EgressIdentity,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchFailure> {
        let client = self.client_for(identity)?;
        let headers = header_map(&request.headers)?;
        let started = Instant::now();

        let response = client
            .request(request.method, request.url)
            .headers(headers)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| map_reqwest_error(&err))?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect::<Vec<_>>();
        let body = read_body(response, self.options.max_body_bytes).await?;

        Ok(FetchResponse {
            status,
            url,
            headers,
            body,
            latency: started.elapsed(),
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        request: PreparedRequest,
        identity: &'a EgressIdentity,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<FetchResponse, FetchFailure>> {
        Box::pin(self.execute(request, identity, timeout))
    }
}

impl Prober for HttpFetcher {
    fn probe<'a>(
        &'a self,
        identity: &'a EgressIdentity,
        target: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Duration, FetchFailure>> {
        Box::pin(async move {
            let url = url::Url::parse(target).map_err(|err| FetchFailure::InvalidRequest {
                detail: format!("probe url {target:?}: {err}"),
            })?;
            let request = PreparedRequest {
                method: Method::GET,
                url,
                headers: Vec::new(),
            };
            let response = self.execute(request, identity, timeout).await?;
            if response.is_success() {
                Ok(response.latency)
            } else {
                Err(FetchFailure::HttpStatus {
                    status: response.status,
                })
            }
        })
    }
}

/// Reads the body chunk by chunk, failing once it grows past `limit` bytes.
async fn read_body(mut response: reqwest::Response, limit: usize) -> Result<Bytes, FetchFailure> {
    let too_large = || FetchFailure::Transport {
        detail: format!("response body exceeds {limit} bytes"),
    };
    if response
        .content_length()
        .is_some_and(|declared| declared > limit as u64)
    {
        return Err(too_large());
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| map_reqwest_error(&err))?
    {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn build_client(options: &FetchClientOptions, proxy: Option<&str>) -> Result<Client, FetchFailure> {
    let mut builder = Client::builder()
        .connect_timeout(options.connect_timeout)
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .redirect(redirect::Policy::limited(options.max_redirects));

    builder = match proxy {
        Some(endpoint) => {
            let proxy = Proxy::all(endpoint).map_err(|err| FetchFailure::Transport {
                detail: format!("invalid proxy {endpoint}: {err}"),
            })?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    builder.build().map_err(|err| FetchFailure::Transport {
        detail: format!("failed to build HTTP client: {err}"),
    })
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, FetchFailure> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| FetchFailure::InvalidRequest {
                detail: format!("invalid header name {name:?}"),
            })?;
        let value = HeaderValue::from_str(value).map_err(|_| FetchFailure::InvalidRequest {
            detail: format!("invalid value for header {name}"),
        })?;
        map.append(name, value);
    }
    Ok(map)
}

pub(crate) fn map_reqwest_error(err: &reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        return FetchFailure::Timeout;
    }
    if err.is_builder() {
        return FetchFailure::InvalidRequest {
            detail: err.to_string(),
        };
    }

    let detail = error_chain(err);
    if err.is_connect() {
        let lowered = detail.to_ascii_lowercase();
        if lowered.contains("dns")
            || lowered.contains("lookup")
            || lowered.contains("resolve")
            || lowered.contains("name or service not known")
        {
            return FetchFailure::Dns { detail };
        }
        if lowered.contains("refused") {
            return FetchFailure::ConnectionRefused { detail };
        }
    }

    FetchFailure::Transport { detail }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
