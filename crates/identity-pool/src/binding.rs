//! Composite identity resource: one session plus its egress endpoint
//!
//! Identity and network path move together. `IdentityPool` acquires both under
//! one lock so concurrent runs never observe a session bound to an endpoint
//! another acquisition is about to hand out, and routes failure reports to the
//! pool that owns the failing half.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use platform::{AuthContext, ErrorClassification};
use tokio::sync::Mutex;
use tracing::debug;

use crate::egress::{EgressPool, SelectedEgress};
use crate::error::Result;
use crate::session::{SelectedSession, SessionPool};

/// A session together with the egress endpoint it is bound to.
///
/// `egress` is `None` when the egress pool is empty and requests go direct.
#[derive(Debug, Clone)]
pub struct IdentityBinding {
    pub session: SelectedSession,
    pub egress: Option<SelectedEgress>,
}

impl IdentityBinding {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn egress_key(&self) -> Option<&str> {
        self.egress.as_ref().map(|e| e.key.as_str())
    }

    pub fn auth_context(&self) -> AuthContext {
        AuthContext {
            session_id: self.session.id.clone(),
            identity: self.session.identity.clone(),
            credentials: self.session.credentials.clone(),
            egress: self.egress.as_ref().map(|e| e.route.clone()),
        }
    }
}

pub struct IdentityPool {
    sessions: Arc<SessionPool>,
    egress: Arc<EgressPool>,
    acquire_lock: Mutex<()>,
}

impl IdentityPool {
    pub fn new(sessions: Arc<SessionPool>, egress: Arc<EgressPool>) -> Self {
        Self {
            sessions,
            egress,
            acquire_lock: Mutex::new(()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    pub fn egress(&self) -> &Arc<EgressPool> {
        &self.egress
    }

    /// Acquire a session and bind its egress endpoint.
    pub async fn acquire(&self, preferred: Option<&str>) -> Result<IdentityBinding> {
        let _guard = self.acquire_lock.lock().await;
        let session = self.sessions.get_next(preferred).await?;
        let egress = self.egress.bind(&session.id).await?;
        debug!(
            session_id = %session.id,
            egress = egress.as_ref().map(|e| e.key.as_str()).unwrap_or("direct"),
            "identity acquired"
        );
        Ok(IdentityBinding { session, egress })
    }

    /// Acquire a session not in `tried`. `Ok(None)` when every active session
    /// has been tried.
    pub async fn acquire_untried(&self, tried: &HashSet<String>) -> Result<Option<IdentityBinding>> {
        let _guard = self.acquire_lock.lock().await;
        let Some(session) = self.sessions.next_untried(tried).await else {
            return Ok(None);
        };
        let egress = self.egress.bind(&session.id).await?;
        Ok(Some(IdentityBinding { session, egress }))
    }

    pub async fn release(&self, binding: &IdentityBinding) {
        self.egress.release(binding.session_id()).await;
    }

    pub async fn report_success(&self, binding: &IdentityBinding, elapsed: Option<Duration>) {
        self.sessions.mark_good(binding.session_id()).await;
        if let Some(key) = binding.egress_key() {
            self.egress.mark_good(key, elapsed).await;
        }
    }

    /// Route a classified failure to the pool that owns the failing half.
    ///
    /// - SessionInvalid counts against the session only
    /// - RateLimited counts against both, since either may be throttled
    /// - Transient counts against the egress endpoint only
    /// - NotFound and Cancelled say nothing about resource health
    pub async fn report_failure(&self, binding: &IdentityBinding, classification: ErrorClassification) {
        let session_id = binding.session_id();
        match classification {
            ErrorClassification::SessionInvalid => {
                self.sessions.mark_bad(session_id).await;
            }
            ErrorClassification::RateLimited => {
                self.sessions.mark_bad(session_id).await;
                if let Some(key) = binding.egress_key() {
                    self.egress.mark_bad(key).await;
                }
            }
            ErrorClassification::Transient => {
                if let Some(key) = binding.egress_key() {
                    self.egress.mark_bad(key).await;
                }
            }
            ErrorClassification::NotFound | ErrorClassification::Cancelled => {
                debug!(
                    session_id,
                    class = classification.label(),
                    "failure does not affect identity health"
                );
            }
        }
    }

    pub async fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "sessions": self.sessions.health().await,
            "egress": self.egress.health().await,
        })
    }
}
