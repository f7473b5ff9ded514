use crate::net::FetchFailure;
use std::collections::BTreeSet;

pub const DEFAULT_RETRYABLE_HTTP_CODES: &[u16] = &[500, 502, 503, 504, 408, 429, 523, 524];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    NonRetryable,
    /// The request itself is unusable; it is dropped without a dead letter.
    Malformed,
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    retryable_codes: BTreeSet<u16>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_HTTP_CODES.iter().copied())
    }
}

impl FailureClassifier {
    pub fn new(retryable_codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            retryable_codes: retryable_codes.into_iter().collect(),
        }
    }

    pub fn classify(&self, failure: &FetchFailure) -> FailureClass {
        match failure {
            FetchFailure::InvalidRequest { .. } => FailureClass::Malformed,
            FetchFailure::HttpStatus { status } if self.retryable_codes.contains(status) => {
                FailureClass::Retryable
            }
            FetchFailure::HttpStatus { .. } => FailureClass::NonRetryable,
            // a soft block on this identity; another identity may get through
            FetchFailure::Rejected { .. } => FailureClass::Retryable,
            FetchFailure::Timeout
            | FetchFailure::Dns { .. }
            | FetchFailure::ConnectionRefused { .. }
            | FetchFailure::Transport { .. }
            | FetchFailure::Cancelled => FailureClass::Retryable,
        }
    }
}
