pub mod deadletter;
pub mod dispatch;
pub mod identity;
pub mod net;
pub mod retry;
pub mod runtime;

pub use deadletter::{DeadLetterEntry, DeadLetterSink, DeadLetterStats, RequestSnapshot};
pub use dispatch::{
    CrawlRequest, DispatchOutcome, Dispatcher, DomainSnapshot, Frontier, ThrottleSettings,
};
pub use identity::{
    EgressIdentity, Fingerprint, FingerprintGenerator, HealthMonitor, HealthState, IdentityError,
    IdentityHealth, IdentityId, IdentityPool, IdentityPoolStats, IdentityStats, ProbeSummary,
};
pub use net::{
    FetchClientOptions, FetchFailure, FetchResponse, FetchStage, Fetcher, HttpFetcher,
    PreparedRequest, Prober, StageContext, StagePipeline,
};
pub use retry::{BackoffSchedule, FailureClass, FailureClassifier, RetryDecision};
pub use runtime::config::{
    ConfigError, DispatcherConfig, DispatcherConfigBuilder, DispatcherConfigParams, IdentitySpec,
};
pub use runtime::handler::{Delivery, HandlerError, HandlerFuture, HandlerStage, ResponseHandler};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
