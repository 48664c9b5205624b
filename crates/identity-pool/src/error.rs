//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The credential source yielded nothing; a run cannot start.
    #[error("no credentials available")]
    NoCredentialsAvailable,

    #[error("session not found: {0}")]
    NotFound(String),

    /// Every egress endpoint is cooling down.
    #[error("egress pool exhausted: {0}")]
    EgressExhausted(String),

    #[error("credential source error: {0}")]
    Source(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
