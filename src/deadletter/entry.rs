use crate::dispatch::CrawlRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frozen copy of an abandoned request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub domain: String,
    pub attempt_count: u32,
    #[serde(default)]
    pub metadata: Value,
}

impl From<&CrawlRequest> for RequestSnapshot {
    fn from(request: &CrawlRequest) -> Self {
        Self {
            url: request.url().to_owned(),
            method: request.method().to_owned(),
            headers: request.headers().to_vec(),
            domain: request.domain().to_owned(),
            attempt_count: request.attempt_count(),
            metadata: request.metadata().clone(),
        }
    }
}

/// Immutable record of a request the engine gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    request: RequestSnapshot,
    reason: String,
    detail: String,
    spider: String,
    failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(request: &CrawlRequest, reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            request: RequestSnapshot::from(request),
            reason: reason.into(),
            detail: detail.into(),
            spider: request.spider().to_owned(),
            failed_at: Utc::now(),
        }
    }

    pub fn request(&self) -> &RequestSnapshot {
        &self.request
    }

    /// Aggregation key, e.g. `HTTP 503`.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Human-readable description of the final failure.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn spider(&self) -> &str {
        &self.spider
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn attempt_count(&self) -> u32 {
        self.request.attempt_count
    }

    pub fn failed_at(&self) -> DateTime<Utc> {
        self.failed_at
    }
}
