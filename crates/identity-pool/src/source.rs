//! External sources the pools are initialized from

use platform::{BoxFuture, EgressRoute, SessionSeed};

use crate::error::Result;

/// Loads credential bundles for the session pool.
pub trait CredentialSource: Send + Sync {
    fn load_sessions(&self) -> BoxFuture<'_, Result<Vec<SessionSeed>>>;
}

/// Loads egress routes for the egress pool.
pub trait EgressSource: Send + Sync {
    fn load_routes(&self) -> BoxFuture<'_, Result<Vec<EgressRoute>>>;
}

impl CredentialSource for Vec<SessionSeed> {
    fn load_sessions(&self) -> BoxFuture<'_, Result<Vec<SessionSeed>>> {
        let seeds = self.clone();
        Box::pin(async move { Ok(seeds) })
    }
}

impl EgressSource for Vec<EgressRoute> {
    fn load_routes(&self) -> BoxFuture<'_, Result<Vec<EgressRoute>>> {
        let routes = self.clone();
        Box::pin(async move { Ok(routes) })
    }
}
