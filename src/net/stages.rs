//! Statically composed fetch stages.
//!
//! A [`StagePipeline`] is assembled once, before the dispatcher starts, and its
//! order never changes afterwards. Every stage sees each attempt three ways:
//! `before_request` may edit the outgoing request, `on_response` may veto a
//! successful response, and `on_error` observes failures.

use crate::dispatch::CrawlRequest;
use crate::identity::{EgressIdentity, Fingerprint};
use crate::net::FetchFailure;
use bytes::Bytes;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Outgoing request after validation, ready to be edited by stages.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl PreparedRequest {
    pub fn from_request(request: &CrawlRequest) -> Result<Self, FetchFailure> {
        let method = Method::from_bytes(request.method().trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| FetchFailure::InvalidRequest {
                detail: format!("unsupported method {:?}", request.method()),
            })?;

        let url = Url::parse(request.url().trim()).map_err(|err| FetchFailure::InvalidRequest {
            detail: format!("malformed url {:?}: {err}", request.url()),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchFailure::InvalidRequest {
                detail: format!("unsupported scheme {}", url.scheme()),
            });
        }
        if url.host_str().is_none() {
            return Err(FetchFailure::InvalidRequest {
                detail: format!("url {:?} has no host", request.url()),
            });
        }

        Ok(Self {
            method,
            url,
            headers: request.headers().to_vec(),
        })
    }

    /// Sets `name` to `value`, replacing any existing value case-insensitively.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name.to_owned(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Raw response handed to stages and, on success, to the response handler.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub latency: Duration,
}

impl FetchResponse {
    /// 2xx and 3xx count as a successful fetch.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Per-attempt view given to every stage.
pub struct StageContext<'a> {
    pub request: &'a CrawlRequest,
    pub identity: &'a EgressIdentity,
    pub fingerprint: &'a Fingerprint,
}

pub trait FetchStage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn before_request(&self, _request: &mut PreparedRequest, _ctx: &StageContext<'_>) {}

    /// Returning an error turns a 2xx/3xx response into a failed attempt.
    fn on_response(
        &self,
        _response: &FetchResponse,
        _ctx: &StageContext<'_>,
    ) -> Result<(), FetchFailure> {
        Ok(())
    }

    fn on_error(&self, _failure: &FetchFailure, _ctx: &StageContext<'_>) {}
}

#[derive(Clone)]
pub struct StagePipeline {
    stages: Arc<[Arc<dyn FetchStage>]>,
}

impl StagePipeline {
    pub fn builder() -> StagePipelineBuilder {
        StagePipelineBuilder::default()
    }

    /// Stage names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub(crate) fn before_request(&self, request: &mut PreparedRequest, ctx: &StageContext<'_>) {
        for stage in self.stages.iter() {
            stage.before_request(request, ctx);
        }
    }

    /// Runs every stage until the first veto.
    pub(crate) fn on_response(
        &self,
        response: &FetchResponse,
        ctx: &StageContext<'_>,
    ) -> Result<(), FetchFailure> {
        for stage in self.stages.iter() {
            stage.on_response(response, ctx)?;
        }
        Ok(())
    }

    pub(crate) fn on_error(&self, failure: &FetchFailure, ctx: &StageContext<'_>) {
        for stage in self.stages.iter() {
            stage.on_error(failure, ctx);
        }
    }
}

impl Default for StagePipeline {
    /// Fingerprint headers first, then tracing.
    fn default() -> Self {
        Self::builder()
            .stage(FingerprintStage)
            .stage(TraceStage)
            .build()
    }
}

#[derive(Default)]
pub struct StagePipelineBuilder {
    stages: Vec<Arc<dyn FetchStage>>,
}

impl StagePipelineBuilder {
    pub fn stage<S: FetchStage>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> StagePipeline {
        StagePipeline {
            stages: self.stages.into(),
        }
    }
}

/// Applies the per-attempt fingerprint: user agent, locale and the
/// randomized header set in its generated order. Caller-supplied headers win.
pub struct FingerprintStage;

impl FetchStage for FingerprintStage {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    fn before_request(&self, request: &mut PreparedRequest, ctx: &StageContext<'_>) {
        let explicit: Vec<String> = request
            .headers
            .iter()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();

        let mut ordered: Vec<(String, String)> = ctx
            .fingerprint
            .headers
            .iter()
            .filter(|(name, _)| !explicit.contains(&name.to_ascii_lowercase()))
            .cloned()
            .collect();
        ordered.append(&mut request.headers);
        request.headers = ordered;

        if request.header("user-agent").is_none() {
            request.set_header("User-Agent", ctx.fingerprint.user_agent.clone());
        }
    }
}

/// Emits per-attempt trace events.
pub struct TraceStage;

impl FetchStage for TraceStage {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn before_request(&self, request: &mut PreparedRequest, ctx: &StageContext<'_>) {
        tracing::trace!(
            url = %request.url,
            method = %request.method,
            identity = %ctx.identity.id(),
            profile = %ctx.fingerprint.profile_id,
            attempt = ctx.request.attempt_count(),
            "dispatching fetch"
        );
    }

    fn on_response(
        &self,
        response: &FetchResponse,
        ctx: &StageContext<'_>,
    ) -> Result<(), FetchFailure> {
        tracing::trace!(
            url = %response.url,
            status = response.status,
            latency_ms = response.latency.as_millis() as u64,
            identity = %ctx.identity.id(),
            "fetch completed"
        );
        Ok(())
    }

    fn on_error(&self, failure: &FetchFailure, ctx: &StageContext<'_>) {
        tracing::debug!(
            url = ctx.request.url(),
            identity = %ctx.identity.id(),
            attempt = ctx.request.attempt_count(),
            error = %failure,
            "fetch attempt failed"
        );
    }
}
