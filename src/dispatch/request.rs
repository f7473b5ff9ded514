use crate::identity::IdentityId;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// One logical fetch travelling through the frontier until it is delivered,
/// dead-lettered, or discarded.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    id: u64,
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    domain: String,
    spider: String,
    attempt_count: u32,
    metadata: Value,
    eligible_at: Instant,
    last_identity: Option<IdentityId>,
    /// Set when the latest attempt was cut short by shutdown; the next
    /// dispatch resumes that attempt instead of counting a new one.
    interrupted: bool,
}

impl CrawlRequest {
    /// Creates a `GET` request owned by `spider`. The domain is taken from the
    /// URL host; malformed URLs are accepted here and discarded at dispatch.
    pub fn new(spider: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let domain = url::Url::parse(url.trim())
            .ok()
            .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
            .unwrap_or_default();

        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            url,
            method: "GET".to_owned(),
            headers: Vec::new(),
            domain,
            spider: spider.into(),
            attempt_count: 0,
            metadata: Value::Null,
            eligible_at: Instant::now(),
            last_identity: None,
            interrupted: false,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Overrides the domain used for per-domain pacing.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Delays the first dispatch until `at`.
    pub fn not_before(mut self, at: Instant) -> Self {
        self.eligible_at = at;
        self
    }

    /// Process-unique identifier, stable across retries.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn spider(&self) -> &str {
        &self.spider
    }

    /// Number of fetch attempts dispatched so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn eligible_at(&self) -> Instant {
        self.eligible_at
    }

    pub fn last_identity(&self) -> Option<IdentityId> {
        self.last_identity
    }

    pub(crate) fn begin_attempt(&mut self, identity: IdentityId) {
        if !std::mem::take(&mut self.interrupted) {
            self.attempt_count = self.attempt_count.saturating_add(1);
        }
        self.last_identity = Some(identity);
    }

    pub(crate) fn interrupt(&mut self) {
        self.interrupted = self.attempt_count > 0;
    }

    pub(crate) fn reschedule(&mut self, at: Instant) {
        self.eligible_at = at;
    }
}
