//! Outcome values produced once per fetch attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const BODY_SNIPPET_CHARS: usize = 256;

/// Classification of a single fetch attempt.
///
/// Adversarial conditions (`RateLimited`, `Blocked`, `CaptchaRequired`) and
/// transport failures (`NetworkError`, `Timeout`) are ordinary values here;
/// callers decide what to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    RateLimited,
    Blocked,
    CaptchaRequired,
    NetworkError,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::RateLimited => "rate_limited",
            OutcomeKind::Blocked => "blocked",
            OutcomeKind::CaptchaRequired => "captcha_required",
            OutcomeKind::NetworkError => "network_error",
            OutcomeKind::Timeout => "timeout",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, OutcomeKind::Success)
    }

    /// Outcomes that indicate the target is pushing back on our egress path.
    pub fn is_pushback(self) -> bool {
        matches!(self, OutcomeKind::RateLimited | OutcomeKind::Blocked)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one fetch attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub kind: OutcomeKind,
    pub http_status: Option<u16>,
    pub body_snippet: Option<String>,
    pub elapsed: Duration,
}

impl RequestOutcome {
    pub fn new(kind: OutcomeKind, elapsed: Duration) -> Self {
        Self {
            kind,
            http_status: None,
            body_snippet: None,
            elapsed,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Keeps at most the first 256 characters of `body`.
    pub fn with_body_snippet(mut self, body: &str) -> Self {
        if !body.is_empty() {
            self.body_snippet = Some(body.chars().take(BODY_SNIPPET_CHARS).collect());
        }
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.body_snippet = Some(message.into());
        self
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_is_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        let outcome = RequestOutcome::new(OutcomeKind::Success, Duration::from_millis(5))
            .with_body_snippet(&body);
        assert_eq!(outcome.body_snippet.unwrap().chars().count(), 256);
    }

    #[test]
    fn pushback_covers_rate_limit_and_block_only() {
        assert!(OutcomeKind::RateLimited.is_pushback());
        assert!(OutcomeKind::Blocked.is_pushback());
        assert!(!OutcomeKind::CaptchaRequired.is_pushback());
        assert!(!OutcomeKind::Timeout.is_pushback());
    }
}
