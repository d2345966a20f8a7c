//! Upstream error classification.
//!
//! Maps an [`AdapterError`] onto the client-visible [`ErrorKind`] taxonomy
//! and produces a masked, provider-qualified message. Rules are checked in a
//! fixed order and the first match wins, so the same input always yields the
//! same classification.

use std::sync::OnceLock;

use regex::Regex;

use crate::adapter::AdapterError;
use crate::error::ErrorKind;

/// Result of classifying one upstream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub http_status: u16,
    /// Safe to show a client. Never contains raw provider text.
    pub client_message: String,
    pub retryable: bool,
}

struct Rule {
    kind: ErrorKind,
    statuses: &'static [u16],
    pattern: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::AuthenticationError,
        statuses: &[401, 403],
        pattern: r"authenticat|api[ _-]?key|unauthori[sz]ed|permission denied|forbidden",
    },
    Rule {
        kind: ErrorKind::RateLimitError,
        statuses: &[429],
        pattern: r"rate[ _-]?limit|quota|too many requests",
    },
    Rule {
        kind: ErrorKind::TimeoutError,
        statuses: &[408, 504],
        pattern: r"time[ds]?[ _-]?out",
    },
    Rule {
        kind: ErrorKind::ServiceUnavailable,
        statuses: &[502, 503],
        pattern: r"connection|unreachable|unavailable|refused|overloaded",
    },
    Rule {
        kind: ErrorKind::ModelNotFound,
        statuses: &[404],
        pattern: r"model.*(not found|does not exist|not exist)",
    },
];

fn compiled_rules() -> &'static [(ErrorKind, &'static [u16], Regex)] {
    static COMPILED: OnceLock<Vec<(ErrorKind, &'static [u16], Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|rule| {
                match Regex::new(&format!("(?i){}", rule.pattern)) {
                    Ok(re) => Some((rule.kind, rule.statuses, re)),
                    Err(e) => {
                        tracing::error!(pattern = rule.pattern, error = %e, "Invalid classifier pattern");
                        None
                    }
                }
            })
            .collect()
    })
}

/// Kind implied by the error variant alone, before text matching.
fn kind_from_variant(error: &AdapterError) -> Option<ErrorKind> {
    match error {
        AdapterError::Timeout(_) => Some(ErrorKind::TimeoutError),
        AdapterError::Connect(_) => Some(ErrorKind::ServiceUnavailable),
        _ => None,
    }
}

fn matched_kind(error: &AdapterError) -> ErrorKind {
    let status = match error {
        AdapterError::Status { status, .. } => Some(*status),
        _ => None,
    };
    let text = error.to_string();
    let variant_kind = kind_from_variant(error);

    for (kind, statuses, pattern) in compiled_rules() {
        let by_variant = variant_kind == Some(*kind);
        let by_status = status.is_some_and(|s| statuses.contains(&s));
        if by_variant || by_status || pattern.is_match(&text) {
            return *kind;
        }
    }
    ErrorKind::InternalError
}

/// Classify an upstream failure for `service` (the provider kind) serving
/// `model` (the public model name).
pub fn classify(error: &AdapterError, service: &str, model: &str) -> ErrorClassification {
    let kind = matched_kind(error);

    let (client_message, retryable) = match kind {
        ErrorKind::AuthenticationError => (
            format!("{} authentication failed. Please check your API key.", service),
            false,
        ),
        ErrorKind::RateLimitError => (
            format!(
                "{} rate limit exceeded. Please wait before making more requests.",
                service
            ),
            true,
        ),
        ErrorKind::TimeoutError => (
            format!(
                "{} request timed out. The service may be experiencing high load.",
                service
            ),
            true,
        ),
        ErrorKind::ServiceUnavailable => (
            format!("Service temporarily unavailable: {}. Please try again later.", service),
            true,
        ),
        ErrorKind::ModelNotFound => (
            format!("Model not found or not available: {}", model),
            false,
        ),
        _ => (
            format!("{} request failed. Please try again later.", service),
            false,
        ),
    };

    ErrorClassification {
        kind,
        http_status: kind.status().as_u16(),
        client_message,
        retryable,
    }
}
