//! Catalogue error types.

use thiserror::Error;

/// Catalogue operation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("does not exist")]
    DoesNotExist,

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for catalogue operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
