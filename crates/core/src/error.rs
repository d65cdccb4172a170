//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown archive format: {0}")]
    UnknownArchiveFormat(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
