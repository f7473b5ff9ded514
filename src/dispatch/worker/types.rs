use crate::net::{FetchFailure, FetchResponse};
use crate::retry::RetryDecision;
use std::time::Duration;

/// What became of one request a worker picked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Fetched and handed to the response handler.
    Delivered,
    /// No identity was available; the request went back untouched.
    Deferred,
    /// The attempt failed and the retry governor settled it.
    Failed(RetryDecision),
}

/// Result of the fetch and its response stages, before any bookkeeping.
pub(super) enum AttemptResult {
    Fetched(FetchResponse),
    Failed {
        failure: FetchFailure,
        /// Present when the server answered, so pacing can learn from it.
        response_latency: Option<Duration>,
    },
}
