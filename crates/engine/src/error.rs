//! Engine error types.

use stowage_backend::BackendError;
use stowage_catalog::CatalogError;
use thiserror::Error;

/// Errors surfaced by the scheduler and orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
