//! Session pool: round-robin selection with failure-based retirement
//!
//! Each session carries usage and failure counters. Consecutive failures at or
//! past the threshold retire the session; a confirmed success clears the streak
//! and returns a retired session to rotation. When every session is retired the
//! pool revives the one whose last failure is oldest, so selection never
//! deadlocks on a fully retired pool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use platform::{CredentialBundle, SessionSeed};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::source::CredentialSource;

#[derive(Debug)]
struct SessionState {
    seed: SessionSeed,
    usage_count: u64,
    error_count: u32,
    consecutive_failures: u32,
    retired: bool,
    last_failure: Option<Instant>,
}

impl SessionState {
    fn new(seed: SessionSeed) -> Self {
        Self {
            seed,
            usage_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            retired: false,
            last_failure: None,
        }
    }

    fn clear(&mut self) {
        self.error_count = 0;
        self.consecutive_failures = 0;
        self.retired = false;
        self.last_failure = None;
    }
}

/// A session handed out by the pool, ready to build an auth context from.
#[derive(Debug, Clone)]
pub struct SelectedSession {
    pub id: String,
    pub identity: String,
    pub credentials: CredentialBundle,
}

pub struct SessionPool {
    sessions: RwLock<Vec<SessionState>>,
    next_index: AtomicUsize,
    failure_threshold: u32,
}

impl SessionPool {
    /// Load sessions from a credential source.
    ///
    /// Fails with `NoCredentialsAvailable` when the source yields nothing.
    pub async fn initialize(source: &dyn CredentialSource, failure_threshold: u32) -> Result<Self> {
        let seeds = source.load_sessions().await?;
        Self::from_seeds(seeds, failure_threshold)
    }

    /// Build a pool from already-loaded seeds. Duplicate ids keep the first entry.
    pub fn from_seeds(seeds: Vec<SessionSeed>, failure_threshold: u32) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut sessions = Vec::with_capacity(seeds.len());
        for seed in seeds {
            if !ids.insert(seed.id.clone()) {
                warn!(session_id = %seed.id, "duplicate session id ignored");
                continue;
            }
            sessions.push(SessionState::new(seed));
        }
        if sessions.is_empty() {
            return Err(Error::NoCredentialsAvailable);
        }
        info!(sessions = sessions.len(), "session pool initialized");
        Ok(Self {
            sessions: RwLock::new(sessions),
            next_index: AtomicUsize::new(0),
            failure_threshold: failure_threshold.max(1),
        })
    }

    /// Select a session, honoring `preferred` when it names an active one.
    ///
    /// Falls back to round-robin over non-retired sessions. With every session
    /// retired, the least-recently-failed one is revived and returned.
    pub async fn get_next(&self, preferred: Option<&str>) -> Result<SelectedSession> {
        let mut sessions = self.sessions.write().await;
        let n = sessions.len();
        if n == 0 {
            return Err(Error::NoCredentialsAvailable);
        }

        if let Some(preferred) = preferred
            && let Some(idx) = sessions
                .iter()
                .position(|s| s.seed.id == preferred && !s.retired)
        {
            return Ok(select(&mut sessions[idx]));
        }

        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if !sessions[idx].retired {
                return Ok(select(&mut sessions[idx]));
            }
        }

        // Every session retired. `None < Some(_)`, so a never-failed session wins.
        let idx = sessions
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_failure)
            .map(|(idx, _)| idx)
            .ok_or(Error::NoCredentialsAvailable)?;
        let state = &mut sessions[idx];
        warn!(session_id = %state.seed.id, "all sessions retired, reviving least recently failed");
        state.retired = false;
        state.consecutive_failures = 0;
        Ok(select(state))
    }

    /// Next active session whose id is not in `tried`, round-robin.
    pub async fn next_untried(&self, tried: &HashSet<String>) -> Option<SelectedSession> {
        let mut sessions = self.sessions.write().await;
        let n = sessions.len();
        if n == 0 {
            return None;
        }
        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let state = &sessions[idx];
            if !state.retired && !tried.contains(&state.seed.id) {
                return Some(select(&mut sessions[idx]));
            }
        }
        None
    }

    /// Record a confirmed success. Clears the failure streak and un-retires.
    pub async fn mark_good(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        let Some(state) = sessions.iter_mut().find(|s| s.seed.id == session_id) else {
            return;
        };
        state.consecutive_failures = 0;
        state.error_count = state.error_count.saturating_sub(1);
        if state.retired {
            info!(session_id, "session recovered");
            state.retired = false;
        }
    }

    /// Record a failure attributed to the session itself.
    pub async fn mark_bad(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        let Some(state) = sessions.iter_mut().find(|s| s.seed.id == session_id) else {
            return;
        };
        state.error_count += 1;
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        if !state.retired && state.consecutive_failures >= self.failure_threshold {
            warn!(
                session_id,
                consecutive_failures = state.consecutive_failures,
                "session retired"
            );
            state.retired = true;
        } else {
            debug!(
                session_id,
                consecutive_failures = state.consecutive_failures,
                "session failure recorded"
            );
        }
    }

    /// Ids of every non-retired session.
    pub async fn all_active(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|s| !s.retired)
            .map(|s| s.seed.id.clone())
            .collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|s| s.seed.id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Clear counters and retirement for one session.
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .iter_mut()
            .find(|s| s.seed.id == session_id)
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        state.clear();
        info!(session_id, "session reset");
        Ok(())
    }

    pub async fn reset_all(&self) {
        let mut sessions = self.sessions.write().await;
        for state in sessions.iter_mut() {
            state.clear();
        }
        info!(sessions = sessions.len(), "all sessions reset");
    }

    /// Health summary: all active → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let sessions = self.sessions.read().await;
        let total = sessions.len();
        let active = sessions.iter().filter(|s| !s.retired).count();

        let entries: Vec<_> = sessions
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.seed.id,
                    "identity": s.seed.identity,
                    "status": if s.retired { "retired" } else { "active" },
                    "usage_count": s.usage_count,
                    "error_count": s.error_count,
                    "consecutive_failures": s.consecutive_failures,
                })
            })
            .collect();

        let status = if active == total && total > 0 {
            "healthy"
        } else if active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "sessions_total": total,
            "sessions_active": active,
            "sessions_retired": total - active,
            "sessions": entries,
        })
    }
}

fn select(state: &mut SessionState) -> SelectedSession {
    state.usage_count += 1;
    SelectedSession {
        id: state.seed.id.clone(),
        identity: state.seed.identity.clone(),
        credentials: state.seed.credentials.clone(),
    }
}
