//! Authentication context handed to connectors and browser launchers

use common::Secret;
use serde::Deserialize;

/// Opaque credential material for one session.
///
/// The engine never inspects these values; connectors and launchers turn them
/// into headers or cookies.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialBundle {
    pub auth_token: Secret<String>,
    #[serde(default)]
    pub csrf_token: Option<Secret<String>>,
}

/// A credential bundle as produced by a credential source, before the pool
/// attaches health state to it.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub id: String,
    /// Identity (account handle) the credentials belong to.
    pub identity: String,
    pub credentials: CredentialBundle,
}

/// An outbound network path (proxy).
#[derive(Debug, Clone)]
pub struct EgressRoute {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Secret<String>>,
}

impl EgressRoute {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http".into(),
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// Stable identifier, `host:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy url without credentials (safe to log).
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Everything a connector needs to act as one identity over one egress path.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub session_id: String,
    pub identity: String,
    pub credentials: CredentialBundle,
    pub egress: Option<EgressRoute>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn egress_key_and_url_hide_credentials() {
        let route = EgressRoute::new("10.0.0.7", 3128).with_auth("user", "hunter2");
        assert_eq!(route.key(), "10.0.0.7:3128");
        assert_eq!(route.url(), "http://10.0.0.7:3128");
        assert!(!format!("{route:?}").contains("hunter2"));
    }

    #[test]
    fn bundle_deserializes_with_optional_csrf() {
        let bundle: CredentialBundle =
            serde_json::from_str(r#"{"auth_token":"a"}"#).unwrap();
        assert_eq!(bundle.auth_token.expose(), "a");
        assert!(bundle.csrf_token.is_none());
    }
}
