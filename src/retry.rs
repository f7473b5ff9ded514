//! Failure classification, jittered backoff and the retry governor.

pub mod backoff;
pub mod classify;
pub mod governor;

pub use backoff::{BackoffSchedule, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_DELAY};
pub use classify::{FailureClass, FailureClassifier, DEFAULT_RETRYABLE_HTTP_CODES};
pub use governor::{RetryDecision, RetryGovernor, RetryGovernorParams};
