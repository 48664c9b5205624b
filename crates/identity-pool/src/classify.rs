//! Status classification for platform API responses
//!
//! Connectors turn HTTP failures into `FetchError`s here so the pool and the
//! engine agree on what a status means. A 403 is ambiguous on the platform: it
//! can mean a locked account, a per-endpoint rate limit, or a protected
//! resource, so the body decides.

use std::time::Duration;

use platform::{ErrorClassification, FetchError};

/// Body phrases on 401/403 responses that indicate the session itself is bad.
const SESSION_PATTERNS: &[&str] = &[
    "could not authenticate",
    "bad authentication",
    "account is temporarily locked",
    "account has been locked",
    "suspended",
    "login required",
];

/// Body phrases that indicate a rate limit regardless of status code.
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests"];

fn matches_any(body: &str, patterns: &[&str]) -> bool {
    let lower = body.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Classify a failed response by HTTP status and body.
///
/// 429 is always rate limiting, 401 always an invalid session, 404 a missing
/// resource. 403 is resolved by the body patterns above and otherwise treated
/// as an unavailable resource. 408, 5xx and anything else are transient.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => ErrorClassification::RateLimited,
        401 => ErrorClassification::SessionInvalid,
        403 if matches_any(body, SESSION_PATTERNS) => ErrorClassification::SessionInvalid,
        403 if matches_any(body, RATE_LIMIT_PATTERNS) => ErrorClassification::RateLimited,
        403 | 404 => ErrorClassification::NotFound,
        _ => ErrorClassification::Transient,
    }
}

/// Build the `FetchError` a connector should return for a failed response.
pub fn fetch_error_for_status(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> FetchError {
    let detail = format!("status {status}");
    match classify_status(status, body) {
        ErrorClassification::RateLimited => FetchError::RateLimited { retry_after },
        ErrorClassification::SessionInvalid => FetchError::Unauthenticated(detail),
        ErrorClassification::NotFound if status == 403 => FetchError::Forbidden(detail),
        ErrorClassification::NotFound => FetchError::NotFound(detail),
        ErrorClassification::Transient | ErrorClassification::Cancelled => {
            FetchError::Transport(detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_statuses() {
        assert_eq!(classify_status(429, ""), ErrorClassification::RateLimited);
        assert_eq!(classify_status(401, ""), ErrorClassification::SessionInvalid);
        assert_eq!(classify_status(404, ""), ErrorClassification::NotFound);
        assert_eq!(classify_status(500, ""), ErrorClassification::Transient);
        assert_eq!(classify_status(503, ""), ErrorClassification::Transient);
        assert_eq!(classify_status(408, ""), ErrorClassification::Transient);
    }

    #[test]
    fn forbidden_locked_account_is_session_invalid() {
        let body = r#"{"errors":[{"code":326,"message":"To protect our users from spam, your account is temporarily locked."}]}"#;
        assert_eq!(classify_status(403, body), ErrorClassification::SessionInvalid);
    }

    #[test]
    fn forbidden_rate_limit_body() {
        let body = r#"{"errors":[{"code":88,"message":"Rate limit exceeded"}]}"#;
        assert_eq!(classify_status(403, body), ErrorClassification::RateLimited);
    }

    #[test]
    fn forbidden_protected_resource_is_not_found() {
        let body = r#"{"errors":[{"message":"Sorry, you are not authorized to see this status."}]}"#;
        assert_eq!(classify_status(403, body), ErrorClassification::NotFound);
        assert!(matches!(
            fetch_error_for_status(403, body, None),
            FetchError::Forbidden(_)
        ));
    }

    #[test]
    fn fetch_error_round_trips_classification() {
        let retry = Some(Duration::from_secs(30));
        assert_eq!(
            fetch_error_for_status(429, "", retry),
            FetchError::RateLimited { retry_after: retry }
        );
        for status in [401, 404, 429, 502] {
            let err = fetch_error_for_status(status, "", None);
            assert_eq!(err.classify(), classify_status(status, ""));
        }
    }
}
