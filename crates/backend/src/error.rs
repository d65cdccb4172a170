//! Backend error taxonomy.
//!
//! Typed variants each map to one actionable user message and are never
//! retried. `Backend` and `Transport` are recorded on the failing block,
//! which stays eligible for re-claiming.

use thiserror::Error;

/// Storage-backend operation errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("system clock is off by more than the provider tolerates, sync with NTP")]
    ClockSkew,

    #[error("credentials lack permission for this operation")]
    Forbidden,

    #[error("access key is not recognized by the provider")]
    BadCredentials,

    #[error("bucket {bucket} does not exist in region {region}")]
    NotFound { bucket: String, region: String },

    #[error("bucket {bucket} lives in a different region")]
    WrongRegion { bucket: String },

    #[error("bucket name not available: {bucket} ({message})")]
    NameConflict { bucket: String, message: String },

    #[error("provider error {code}: {message}")]
    Backend { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bad encoding: {0}")]
    BadEncoding(String),

    #[error("malformed provider response: {0}")]
    BadResponse(String),

    #[error("invalid block size: {0}")]
    InvalidBlockSize(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// Whether the failing block should stay eligible for another attempt.
    /// Typed provider errors are configuration or environment problems and
    /// abort the run instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Backend { .. } | BackendError::Transport(_)
        )
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
