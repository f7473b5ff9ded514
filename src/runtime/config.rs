use crate::dispatch::throttle::{
    ThrottleSettings, DEFAULT_THROTTLE_MAX_DELAY, DEFAULT_THROTTLE_START_DELAY,
    DEFAULT_THROTTLE_TARGET_CONCURRENCY,
};
use crate::deadletter::DEFAULT_RECENT_CAPACITY;
use crate::retry::{DEFAULT_BACKOFF_BASE, DEFAULT_MAX_DELAY, DEFAULT_RETRYABLE_HTTP_CODES};
use crate::runtime::telemetry;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 8;
const DEFAULT_PER_DOMAIN_CONCURRENCY: usize = 2;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_IDENTITY_EXHAUSTED_DELAY_SECS: u64 = 30;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PROBE_URL: &str = "https://www.gstatic.com/generate_204";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

const PROXY_SCHEMES: &[&str] = &["http://", "https://", "socks5://", "socks5h://"];

/// Invalid startup configuration. Always fatal; returned wrapped in
/// `anyhow::Error` so callers can `downcast_ref::<ConfigError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err(ConfigError::new(format!($($arg)*)).into())
    };
}

/// One configured egress identity: a proxy (or direct egress) plus an
/// optional pinned user agent and fingerprint profile label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentitySpec {
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub profile: Option<String>,
}

impl IdentitySpec {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn proxy(url: impl Into<String>) -> Self {
        Self {
            proxy: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    fn normalized(self) -> Self {
        Self {
            proxy: self.proxy.map(trimmed_string).filter(|p| !p.is_empty()),
            user_agent: self.user_agent.map(trimmed_string).filter(|ua| !ua.is_empty()),
            profile: self.profile.map(trimmed_string).filter(|p| !p.is_empty()),
        }
    }
}

/// Runtime configuration for the dispatch engine.
///
/// All instances must be constructed via [`DispatcherConfig::builder`] or [`DispatcherConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    identities: Vec<IdentitySpec>,
    worker_count: usize,
    per_domain_concurrency: usize,
    max_retries: u32,
    retryable_http_codes: Vec<u16>,
    backoff_base: f64,
    max_delay: Duration,
    identity_exhausted_delay: Duration,
    max_consecutive_failures: u32,
    health_check_interval: Duration,
    probe_timeout: Duration,
    probe_url: String,
    fetch_timeout: Duration,
    shutdown_grace: Duration,
    throttle: ThrottleSettings,
    dead_letter_capacity: usize,
    metrics_interval: Duration,
}

pub struct DispatcherConfigParams {
    pub identities: Vec<IdentitySpec>,
    pub worker_count: usize,
    pub per_domain_concurrency: usize,
    pub max_retries: u32,
    pub retryable_http_codes: Vec<u16>,
    pub backoff_base: f64,
    pub max_delay: Duration,
    pub identity_exhausted_delay: Duration,
    pub max_consecutive_failures: u32,
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_url: String,
    pub fetch_timeout: Duration,
    pub shutdown_grace: Duration,
    pub throttle: ThrottleSettings,
    pub dead_letter_capacity: usize,
    pub metrics_interval: Duration,
}

impl DispatcherConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`DispatcherConfig::builder`] for ergonomics when many values use defaults.
    pub fn new(params: DispatcherConfigParams) -> Result<Self> {
        let DispatcherConfigParams {
            identities,
            worker_count,
            per_domain_concurrency,
            max_retries,
            retryable_http_codes,
            backoff_base,
            max_delay,
            identity_exhausted_delay,
            max_consecutive_failures,
            health_check_interval,
            probe_timeout,
            probe_url,
            fetch_timeout,
            shutdown_grace,
            throttle,
            dead_letter_capacity,
            metrics_interval,
        } = params;

        let config = Self {
            identities: identities.into_iter().map(IdentitySpec::normalized).collect(),
            worker_count,
            per_domain_concurrency,
            max_retries,
            retryable_http_codes,
            backoff_base,
            max_delay,
            identity_exhausted_delay,
            max_consecutive_failures,
            health_check_interval,
            probe_timeout,
            probe_url: trimmed_string(probe_url),
            fetch_timeout,
            shutdown_grace,
            throttle,
            dead_letter_capacity,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Configured egress identities, in selection-id order.
    pub fn identities(&self) -> &[IdentitySpec] {
        &self.identities
    }

    /// Number of concurrent fetch workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Maximum simultaneous fetches against one domain.
    pub fn per_domain_concurrency(&self) -> usize {
        self.per_domain_concurrency
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// HTTP statuses treated as transient.
    pub fn retryable_http_codes(&self) -> &[u16] {
        &self.retryable_http_codes
    }

    pub fn backoff_base(&self) -> f64 {
        self.backoff_base
    }

    /// Upper bound of a single retry delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay applied when no egress identity is available.
    pub fn identity_exhausted_delay(&self) -> Duration {
        self.identity_exhausted_delay
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Stable target used by health probes.
    pub fn probe_url(&self) -> &str {
        &self.probe_url
    }

    /// Bound on one fetch attempt, body included.
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// How long `stop` waits for in-flight fetches before cancelling them.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn throttle(&self) -> ThrottleSettings {
        self.throttle
    }

    /// Number of recent dead letters kept for inspection.
    pub fn dead_letter_capacity(&self) -> usize {
        self.dead_letter_capacity
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.identities.is_empty() {
            invalid!("identities cannot be empty; add at least one proxy or a direct identity");
        }

        let mut seen = HashSet::new();
        for (idx, identity) in self.identities.iter().enumerate() {
            if let Some(proxy) = &identity.proxy {
                validate_proxy(proxy, idx)?;
                if !seen.insert(proxy.to_ascii_lowercase()) {
                    invalid!("identities[{idx}] duplicates proxy {proxy}");
                }
            }
        }

        if self.worker_count == 0 {
            invalid!("worker_count must be greater than 0");
        }

        if self.per_domain_concurrency == 0 {
            invalid!("per_domain_concurrency must be greater than 0");
        }

        if self.max_consecutive_failures == 0 {
            invalid!("max_consecutive_failures must be greater than 0");
        }

        if self.dead_letter_capacity == 0 {
            invalid!("dead_letter_capacity must be greater than 0");
        }

        if let Some(code) = self
            .retryable_http_codes
            .iter()
            .find(|code| !(100..=599).contains(*code))
        {
            invalid!("retryable_http_codes contains {code}, outside 100..=599");
        }

        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            invalid!("backoff_base must be at least 1.0");
        }

        for (field, value) in [
            ("max_delay", self.max_delay),
            ("identity_exhausted_delay", self.identity_exhausted_delay),
            ("health_check_interval", self.health_check_interval),
            ("probe_timeout", self.probe_timeout),
            ("fetch_timeout", self.fetch_timeout),
            ("shutdown_grace", self.shutdown_grace),
            ("metrics_interval", self.metrics_interval),
        ] {
            if value.is_zero() {
                invalid!("{field} must be greater than 0");
            }
        }

        validate_probe_url(&self.probe_url)?;

        if self.throttle.start_delay > self.throttle.max_delay {
            invalid!("throttle_start_delay cannot exceed throttle_max_delay");
        }

        if !self.throttle.target_concurrency.is_finite() || self.throttle.target_concurrency <= 0.0
        {
            invalid!("throttle_target_concurrency must be positive");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DispatcherConfigBuilder {
    identities: Vec<IdentitySpec>,
    worker_count: Option<usize>,
    per_domain_concurrency: Option<usize>,
    max_retries: Option<u32>,
    retryable_http_codes: Option<Vec<u16>>,
    backoff_base: Option<f64>,
    max_delay: Option<Duration>,
    identity_exhausted_delay: Option<Duration>,
    max_consecutive_failures: Option<u32>,
    health_check_interval: Option<Duration>,
    probe_timeout: Option<Duration>,
    probe_url: Option<String>,
    fetch_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
    auto_throttle: Option<bool>,
    throttle_start_delay: Option<Duration>,
    throttle_max_delay: Option<Duration>,
    throttle_target_concurrency: Option<f64>,
    dead_letter_capacity: Option<usize>,
    metrics_interval: Option<Duration>,
}

impl DispatcherConfigBuilder {
    pub fn identity(mut self, identity: IdentitySpec) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn identities(mut self, identities: impl IntoIterator<Item = IdentitySpec>) -> Self {
        self.identities.extend(identities);
        self
    }

    /// Adds one proxy identity with generated fingerprints.
    pub fn proxy(self, url: impl Into<String>) -> Self {
        self.identity(IdentitySpec::proxy(url))
    }

    /// Adds a direct (no proxy) identity.
    pub fn direct(self) -> Self {
        self.identity(IdentitySpec::direct())
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn per_domain_concurrency(mut self, limit: usize) -> Self {
        self.per_domain_concurrency = Some(limit);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retryable_http_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_http_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn identity_exhausted_delay(mut self, delay: Duration) -> Self {
        self.identity_exhausted_delay = Some(delay);
        self
    }

    pub fn max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = Some(failures);
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = Some(url.into());
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn auto_throttle(mut self, enabled: bool) -> Self {
        self.auto_throttle = Some(enabled);
        self
    }

    pub fn throttle_start_delay(mut self, delay: Duration) -> Self {
        self.throttle_start_delay = Some(delay);
        self
    }

    pub fn throttle_max_delay(mut self, delay: Duration) -> Self {
        self.throttle_max_delay = Some(delay);
        self
    }

    pub fn throttle_target_concurrency(mut self, target: f64) -> Self {
        self.throttle_target_concurrency = Some(target);
        self
    }

    pub fn dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = Some(capacity);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<DispatcherConfig> {
        let params = DispatcherConfigParams {
            identities: self.identities,
            worker_count: self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT),
            per_domain_concurrency: self
                .per_domain_concurrency
                .unwrap_or(DEFAULT_PER_DOMAIN_CONCURRENCY),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retryable_http_codes: self
                .retryable_http_codes
                .unwrap_or_else(|| DEFAULT_RETRYABLE_HTTP_CODES.to_vec()),
            backoff_base: self.backoff_base.unwrap_or(DEFAULT_BACKOFF_BASE),
            max_delay: self.max_delay.unwrap_or(DEFAULT_MAX_DELAY),
            identity_exhausted_delay: self
                .identity_exhausted_delay
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_IDENTITY_EXHAUSTED_DELAY_SECS)),
            max_consecutive_failures: self
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            health_check_interval: self
                .health_check_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS)),
            probe_timeout: self
                .probe_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS)),
            probe_url: self
                .probe_url
                .unwrap_or_else(|| DEFAULT_PROBE_URL.to_owned()),
            fetch_timeout: self
                .fetch_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)),
            shutdown_grace: self
                .shutdown_grace
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)),
            throttle: ThrottleSettings {
                enabled: self.auto_throttle.unwrap_or(true),
                start_delay: self
                    .throttle_start_delay
                    .unwrap_or(DEFAULT_THROTTLE_START_DELAY),
                max_delay: self
                    .throttle_max_delay
                    .unwrap_or(DEFAULT_THROTTLE_MAX_DELAY),
                target_concurrency: self
                    .throttle_target_concurrency
                    .unwrap_or(DEFAULT_THROTTLE_TARGET_CONCURRENCY),
            },
            dead_letter_capacity: self.dead_letter_capacity.unwrap_or(DEFAULT_RECENT_CAPACITY),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        DispatcherConfig::new(params).context("failed to build dispatcher configuration")
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn validate_proxy(proxy: &str, idx: usize) -> Result<()> {
    let lowered = proxy.to_ascii_lowercase();
    if !PROXY_SCHEMES.iter().any(|scheme| lowered.starts_with(scheme)) {
        invalid!(
            "identities[{idx}] proxy must start with http://, https://, socks5:// or socks5h://"
        );
    }
    match url::Url::parse(proxy) {
        Ok(parsed) if parsed.host_str().is_some() => Ok(()),
        _ => invalid!("identities[{idx}] proxy {proxy} is not a valid URL"),
    }
}

fn validate_probe_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        invalid!("probe_url must start with http:// or https://");
    }
    Ok(())
}
