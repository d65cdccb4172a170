//! S3 signing engine and multipart protocol client.
//!
//! The backend turns block rows into signed HTTP requests: a deterministic
//! SigV4 canonicalization procedure, the initiate / upload-part / complete
//! handshake, and the composite SHA-256 finalization header.

pub mod client;
pub mod error;
pub mod policy;
pub mod sigv4;
pub mod types;
pub mod xml;

pub use client::S3Backend;
pub use error::{BackendError, BackendResult};
pub use types::{
    CompletedUpload, CreateUploadResult, PartChecksum, PartReceipt, ProgressFn, StorageBackend,
    StorageMetadata, UploadHandle, METADATA_SCHEMA_VERSION,
};

use std::sync::Arc;
use stowage_core::config::{AppConfig, Provider};

/// Build the storage backend for a provider tag.
pub fn backend_for_provider(
    provider: Provider,
    config: &AppConfig,
) -> BackendResult<Arc<dyn StorageBackend>> {
    match provider {
        Provider::Aws => {
            let aws = config
                .aws
                .as_ref()
                .ok_or_else(|| BackendError::Config("missing [aws] section".to_string()))?;
            Ok(Arc::new(S3Backend::new(aws)?))
        }
    }
}
