//! Error types for acquisition runs
//!
//! These never cross `Coordinator::run`: the coordinator folds every one of
//! them into a `RunOutcome`. Inside the engine they let the channel loops use
//! `?` on setup steps that are fatal for the run.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid option combination. Fatal, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A channel collaborator could not be set up.
    #[error("initialization failed: {0}")]
    Init(String),

    #[error(transparent)]
    Pool(#[from] identity_pool::Error),

    #[error("channel launch failed: {0}")]
    Launch(platform::FetchError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the caller may reasonably retry the whole run later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Config(_) | Error::Cancelled => false,
            Error::Pool(identity_pool::Error::NoCredentialsAvailable) => false,
            Error::Pool(_) | Error::Init(_) | Error::Launch(_) | Error::Checkpoint(_) => true,
        }
    }
}

/// Result alias for acquisition operations.
pub type Result<T> = std::result::Result<T, Error>;
