//! Redacting wrapper for credential material

use std::fmt;

use serde::{Deserialize, Deserializer};
use zeroize::Zeroize;

/// Sensitive value such as a session token or proxy password.
///
/// Debug and Display print `[REDACTED]` and the inner value is zeroized on
/// drop. There is no `Serialize` impl: a secret never reaches a checkpoint or
/// a health payload.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<'de, T> Deserialize<'de> for Secret<T>
where
    T: Zeroize + Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Secret::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let token = Secret::new(String::from("auth-token-abc"));
        assert_eq!(format!("{token:?}"), "[REDACTED]");
        assert_eq!(format!("{token}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner_value() {
        let token = Secret::new(String::from("auth-token-abc"));
        assert_eq!(token.expose(), "auth-token-abc");
    }

    #[test]
    fn deserializes_from_plain_string() {
        #[derive(Deserialize)]
        struct Bundle {
            auth_token: Secret<String>,
        }
        let bundle: Bundle = serde_json::from_str(r#"{"auth_token":"tok-1"}"#).unwrap();
        assert_eq!(bundle.auth_token.expose(), "tok-1");
    }

    #[test]
    fn whitespace_only_counts_as_empty() {
        assert!(Secret::new(String::from("  \n")).is_empty());
        assert!(!Secret::new(String::from("x")).is_empty());
    }
}
