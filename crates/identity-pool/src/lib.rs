//! Identity and egress pools for the acquisition engine
//!
//! Manages the authentication contexts (sessions) and outbound network paths
//! (egress endpoints) that runs borrow, with health tracking on both sides.
//! A run never holds one without the other: `IdentityPool::acquire` returns an
//! `IdentityBinding` pairing a session with its sticky egress endpoint.
//!
//! Session lifecycle:
//! 1. Pool loads credential bundles from a `CredentialSource`
//! 2. `get_next` hands sessions out round-robin, skipping retired ones
//! 3. Failures count up; past the threshold the session retires
//! 4. Any confirmed success resets the consecutive-failure counter
//! 5. When every session is retired, the least-recently-failed one is revived
//!
//! Egress lifecycle:
//! 1. Failures past the threshold put an endpoint into cooldown
//! 2. The endpoint stays unselectable until the cooldown deadline has passed
//! 3. The next selection after the deadline revives it without outside action

pub mod binding;
pub mod classify;
pub mod egress;
pub mod error;
pub mod session;
pub mod source;

pub use binding::{IdentityBinding, IdentityPool};
pub use classify::{classify_status, fetch_error_for_status};
pub use egress::{EgressPool, SelectedEgress};
pub use error::{Error, Result};
pub use session::{SelectedSession, SessionPool};
pub use source::{CredentialSource, EgressSource};

use std::time::Duration;

use serde::Deserialize;

/// Consecutive failures before a session retires.
pub const DEFAULT_SESSION_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive failures before an egress endpoint enters cooldown.
pub const DEFAULT_EGRESS_FAILURE_THRESHOLD: u32 = 3;

/// How long an unhealthy egress endpoint stays unselectable.
pub const DEFAULT_EGRESS_COOLDOWN_SECS: u64 = 300;

/// Pool thresholds, deserialized from the `[pool]` config table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub session_failure_threshold: u32,
    pub egress_failure_threshold: u32,
    pub egress_cooldown_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session_failure_threshold: DEFAULT_SESSION_FAILURE_THRESHOLD,
            egress_failure_threshold: DEFAULT_EGRESS_FAILURE_THRESHOLD,
            egress_cooldown_secs: DEFAULT_EGRESS_COOLDOWN_SECS,
        }
    }
}

impl PoolConfig {
    pub fn egress_cooldown(&self) -> Duration {
        Duration::from_secs(self.egress_cooldown_secs)
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.session_failure_threshold == 0 {
            return Err(common::Error::Config(
                "session_failure_threshold must be greater than 0".into(),
            ));
        }
        if self.egress_failure_threshold == 0 {
            return Err(common::Error::Config(
                "egress_failure_threshold must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
