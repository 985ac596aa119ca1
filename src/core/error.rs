use crate::storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacingError {
    /// Malformed input: empty context id, bad config, malformed whitelist file.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("operation cancelled")]
    Cancelled,
}

impl PacingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PacingError::Validation(msg.into())
    }
}
