//! Failure taxonomy for a single fetch attempt. Every way a fetch can go wrong
//! ends up as one `FetchFailure`, which the retry governor classifies.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    Timeout,
    Dns { detail: String },
    ConnectionRefused { detail: String },
    Transport { detail: String },
    /// The attempt was aborted by shutdown before it completed.
    Cancelled,
    HttpStatus { status: u16 },
    /// A response stage refused an otherwise successful response.
    Rejected { stage: &'static str, reason: String },
    InvalidRequest { detail: String },
}

impl FetchFailure {
    /// Stable label used as the dead-letter aggregation key.
    pub fn reason(&self) -> String {
        match self {
            FetchFailure::Timeout => "Timeout".to_owned(),
            FetchFailure::Dns { .. } => "DNS failure".to_owned(),
            FetchFailure::ConnectionRefused { .. } => "Connection refused".to_owned(),
            FetchFailure::Transport { .. } => "Transport error".to_owned(),
            FetchFailure::Cancelled => "Cancelled".to_owned(),
            FetchFailure::HttpStatus { status } => format!("HTTP {status}"),
            FetchFailure::Rejected { stage, .. } => format!("Rejected by {stage}"),
            FetchFailure::InvalidRequest { .. } => "Invalid request".to_owned(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FetchFailure::Timeout
                | FetchFailure::Dns { .. }
                | FetchFailure::ConnectionRefused { .. }
                | FetchFailure::Transport { .. }
                | FetchFailure::Cancelled
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchFailure::HttpStatus { status } => Some(*status),
            _ => None,
        }
    }

    /// Whether the egress identity should be charged for this failure.
    pub(crate) fn charges_identity(&self) -> bool {
        !matches!(
            self,
            FetchFailure::Cancelled | FetchFailure::InvalidRequest { .. }
        )
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "fetch timed out"),
            FetchFailure::Dns { detail } => write!(f, "DNS resolution failed: {detail}"),
            FetchFailure::ConnectionRefused { detail } => {
                write!(f, "connection refused: {detail}")
            }
            FetchFailure::Transport { detail } => write!(f, "transport error: {detail}"),
            FetchFailure::Cancelled => write!(f, "fetch cancelled during shutdown"),
            FetchFailure::HttpStatus { status } => write!(f, "server answered HTTP {status}"),
            FetchFailure::Rejected { stage, reason } => {
                write!(f, "response rejected by {stage}: {reason}")
            }
            FetchFailure::InvalidRequest { detail } => write!(f, "invalid request: {detail}"),
        }
    }
}

impl std::error::Error for FetchFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_stable_aggregation_keys() {
        assert_eq!(FetchFailure::HttpStatus { status: 503 }.reason(), "HTTP 503");
        assert_eq!(FetchFailure::Timeout.reason(), "Timeout");
        assert_eq!(
            FetchFailure::Dns {
                detail: "no such host".into()
            }
            .reason(),
            "DNS failure"
        );
        assert_eq!(
            FetchFailure::Rejected {
                stage: "captcha",
                reason: "challenge page".into()
            }
            .reason(),
            "Rejected by captcha"
        );
    }

    #[test]
    fn cancellation_is_transport_but_not_charged() {
        let failure = FetchFailure::Cancelled;
        assert!(failure.is_transport());
        assert!(!failure.charges_identity());
        assert!(FetchFailure::HttpStatus { status: 404 }.charges_identity());
        assert!(!FetchFailure::HttpStatus { status: 404 }.is_transport());
    }
}
