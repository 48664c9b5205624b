//! Error types for credential and proxy file handling

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("invalid proxy entry on line {line}: {reason}")]
    InvalidProxy { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for identity_pool::Error {
    fn from(err: Error) -> Self {
        identity_pool::Error::Source(err.to_string())
    }
}
