//! Repository error classification.
//!
//! The commit path cares about exactly four shapes: optimistic-concurrency
//! conflicts, rate limits (with an optional server hint), the "use a pull
//! request" refusal, and everything else. They are modelled as variants so
//! the gateway can match instead of grepping exception strings.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RepoError {
    /// A concurrent commit advanced the head since our read revision.
    #[error("precondition failed: a commit has happened since the read revision")]
    PreconditionFailed,

    /// HTTP 429. `retry_after` is the server hint when one was sent;
    /// `message` keeps the body for quota-pattern matching.
    #[error("rate limited: {message}")]
    TooManyRequests {
        retry_after: Option<Duration>,
        message: String,
    },

    /// The server refuses direct commits and wants a pull request.
    #[error("server requires a pull-request commit")]
    UsePullRequest,

    #[error("not found: {0}")]
    NotFound(String),

    /// Any other HTTP status.
    #[error("http {status}: {message}")]
    Http { status: u32, message: String },

    /// Network / local IO failure.
    #[error("transport: {0}")]
    Transport(String),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }
}

/// Wait hinted by a rate-limit error: the explicit retry-after if present,
/// else one hour when the message matches the commit-per-hour quota, else
/// an inline "retry after N seconds" phrase, else nothing.
pub fn rate_limit_wait(err: &RepoError) -> Option<Duration> {
    let RepoError::TooManyRequests {
        retry_after,
        message,
    } = err
    else {
        return None;
    };
    if let Some(d) = retry_after {
        return Some(*d);
    }
    let low = message.to_ascii_lowercase();
    if low.contains("repository commits") || low.contains("commits (") || low.contains("per hour") {
        return Some(Duration::from_secs(3600));
    }
    if let Some(secs) = parse_retry_after_phrase(&low) {
        return Some(Duration::from_secs_f64(secs));
    }
    None
}

/// Extract N from an embedded "retry after N seconds" phrase.
fn parse_retry_after_phrase(low: &str) -> Option<f64> {
    let idx = low.find("retry after")?;
    let rest = low[idx + "retry after".len()..].trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
