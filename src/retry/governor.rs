//! Turns a failed attempt into a bounded retry or a permanent outcome.
//!
//! Retries never sleep: the request gets a new `eligible_at` and goes back to
//! the frontier, so the worker that reported the failure is free at once.

use super::backoff::BackoffSchedule;
use super::classify::{FailureClass, FailureClassifier};
use crate::deadletter::{DeadLetterEntry, DeadLetterSink};
use crate::dispatch::frontier::Frontier;
use crate::dispatch::CrawlRequest;
use crate::net::FetchFailure;
use crate::runtime::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter { reason: String },
    Discard { reason: String },
}

pub struct RetryGovernorParams {
    pub classifier: FailureClassifier,
    pub backoff: BackoffSchedule,
    pub max_retries: u32,
    pub identity_exhausted_delay: Duration,
    pub frontier: Arc<Frontier>,
    pub sink: Arc<DeadLetterSink>,
    pub telemetry: Arc<Telemetry>,
}

pub struct RetryGovernor {
    classifier: FailureClassifier,
    backoff: BackoffSchedule,
    max_retries: u32,
    identity_exhausted_delay: Duration,
    frontier: Arc<Frontier>,
    sink: Arc<DeadLetterSink>,
    telemetry: Arc<Telemetry>,
}

impl RetryGovernor {
    pub fn new(params: RetryGovernorParams) -> Self {
        let RetryGovernorParams {
            classifier,
            backoff,
            max_retries,
            identity_exhausted_delay,
            frontier,
            sink,
            telemetry,
        } = params;
        Self {
            classifier,
            backoff,
            max_retries,
            identity_exhausted_delay,
            frontier,
            sink,
            telemetry,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn classify(&self, failure: &FetchFailure) -> FailureClass {
        self.classifier.classify(failure)
    }

    /// Pure decision for a request whose latest attempt failed. Attempt `n`
    /// (1-based) is retry index `n - 1`; once that index reaches
    /// `max_retries` the request is dead-lettered. A cancelled attempt is
    /// always re-enqueued, and resumed under the same attempt number, so
    /// shutdown never produces a dead letter.
    pub fn decide(&self, request: &CrawlRequest, failure: &FetchFailure) -> RetryDecision {
        match self.classifier.classify(failure) {
            FailureClass::Malformed => RetryDecision::Discard {
                reason: failure.reason(),
            },
            FailureClass::NonRetryable => RetryDecision::DeadLetter {
                reason: failure.reason(),
            },
            FailureClass::Retryable => {
                let retry = request.attempt_count().saturating_sub(1);
                if retry >= self.max_retries && *failure != FetchFailure::Cancelled {
                    RetryDecision::DeadLetter {
                        reason: failure.reason(),
                    }
                } else {
                    RetryDecision::Retry {
                        delay: self.backoff.delay_with_jitter(retry),
                    }
                }
            }
        }
    }

    /// Decides and applies: re-enqueue, dead-letter, or drop.
    pub fn settle(&self, mut request: CrawlRequest, failure: &FetchFailure) -> RetryDecision {
        let decision = self.decide(&request, failure);
        match &decision {
            RetryDecision::Retry { delay } => {
                tracing::debug!(
                    url = request.url(),
                    attempt = request.attempt_count(),
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "retry scheduled"
                );
                if *failure == FetchFailure::Cancelled {
                    request.interrupt();
                }
                request.reschedule(Instant::now() + *delay);
                self.telemetry.record_retry();
                self.frontier.push(request);
            }
            RetryDecision::DeadLetter { reason } => {
                self.sink
                    .append(DeadLetterEntry::new(&request, reason.clone(), failure.to_string()));
                self.telemetry.record_dead_letter();
                self.frontier.settle();
            }
            RetryDecision::Discard { reason } => {
                tracing::warn!(
                    url = request.url(),
                    spider = request.spider(),
                    reason = reason.as_str(),
                    error = %failure,
                    "request discarded"
                );
                self.telemetry.record_discard();
                self.frontier.settle();
            }
        }
        decision
    }

    /// No identity could be selected. The request is not at fault: it goes
    /// back with an extended delay and its attempt count untouched.
    pub fn defer_for_identity(&self, mut request: CrawlRequest) -> Instant {
        let eligible_at = Instant::now() + self.identity_exhausted_delay;
        tracing::warn!(
            url = request.url(),
            delay_ms = self.identity_exhausted_delay.as_millis() as u64,
            "no egress identity available; request rescheduled"
        );
        request.reschedule(eligible_at);
        self.telemetry.record_identity_exhausted();
        self.frontier.push(request);
        eligible_at
    }
}
