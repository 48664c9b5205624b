//! Fetch error taxonomy shared by the API client and browser driver

use std::time::Duration;

/// Typed failure of a single platform operation.
///
/// Collaborators return these instead of raw transport errors so the engine
/// can decide between local retry, session rotation and stopping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias for platform operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Retry strategy implied by a `FetchError`.
///
/// - `Transient` retries locally with backoff on the same session
/// - `RateLimited` rotates the session (or stops when rotation is exhausted)
/// - `SessionInvalid` rotates and counts against the session's health
/// - `NotFound` is fatal for the page only
/// - `Cancelled` unwinds as a partial success, never as a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    Transient,
    RateLimited,
    SessionInvalid,
    NotFound,
    Cancelled,
}

impl ErrorClassification {
    /// Label used in logs and metric tags.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::SessionInvalid => "session_invalid",
            ErrorClassification::NotFound => "not_found",
            ErrorClassification::Cancelled => "cancelled",
        }
    }
}

/// Transport messages an in-flight operation raises when it is torn down.
///
/// Browser drivers in particular surface a closed page or aborted navigation
/// as a generic error. These only mean cancellation when one was requested;
/// a peer aborting a connection on its own is an ordinary transient fault.
const CANCELLATION_PATTERNS: &[&str] = &[
    "cancelled",
    "canceled",
    "aborted",
    "target closed",
    "browser has disconnected",
];

impl FetchError {
    pub fn classify(&self) -> ErrorClassification {
        match self {
            FetchError::NotFound(_) | FetchError::Forbidden(_) => ErrorClassification::NotFound,
            FetchError::Unauthenticated(_) => ErrorClassification::SessionInvalid,
            FetchError::RateLimited { .. } => ErrorClassification::RateLimited,
            FetchError::Cancelled => ErrorClassification::Cancelled,
            FetchError::Transport(_) | FetchError::Timeout(_) | FetchError::Malformed(_) => {
                ErrorClassification::Transient
            }
        }
    }

    /// Classify a fault raised while the caller's cancellation flag reads
    /// `cancel_requested`. A teardown-shaped transport fault is normalized to
    /// `Cancelled` only when a cancellation was actually requested.
    pub fn classify_during(&self, cancel_requested: bool) -> ErrorClassification {
        if cancel_requested && self.is_teardown() {
            ErrorClassification::Cancelled
        } else {
            self.classify()
        }
    }

    fn is_teardown(&self) -> bool {
        match self {
            FetchError::Cancelled => true,
            FetchError::Transport(msg) | FetchError::Timeout(msg) => is_cancellation_shaped(msg),
            _ => false,
        }
    }
}

fn is_cancellation_shaped(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    CANCELLATION_PATTERNS.iter().any(|p| lower.contains(p))
}
