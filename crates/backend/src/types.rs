//! Storage-backend capability surface.
//!
//! The engine drives uploads exclusively through [`StorageBackend`], so
//! tests can substitute an in-memory implementation for the wire client.

use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Schema version of the metadata blob persisted on the upload row.
pub const METADATA_SCHEMA_VERSION: i64 = 1;

/// Opaque backend metadata carried end-to-end on the upload row. Only the
/// backend that produced it interprets the JSON.
#[derive(Clone, Debug)]
pub struct StorageMetadata {
    pub json: String,
    pub schema_version: i64,
}

/// Parsed multipart-session state, serialized into [`StorageMetadata`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadHandle {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub checksum_algorithm: String,
    #[serde(default)]
    pub checksum_type: String,
    #[serde(default)]
    pub server_side_encryption: String,
}

impl UploadHandle {
    pub fn to_metadata(&self) -> BackendResult<StorageMetadata> {
        let json = serde_json::to_string(self)
            .map_err(|e| BackendError::BadResponse(format!("metadata encode: {e}")))?;
        Ok(StorageMetadata {
            json,
            schema_version: METADATA_SCHEMA_VERSION,
        })
    }

    pub fn from_metadata(json: &str, schema_version: i64) -> BackendResult<Self> {
        if schema_version != METADATA_SCHEMA_VERSION {
            return Err(BackendError::Config(format!(
                "unsupported metadata schema version {schema_version}"
            )));
        }
        serde_json::from_str(json)
            .map_err(|e| BackendError::BadResponse(format!("metadata decode: {e}")))
    }
}

/// Result of creating the provider-side upload resource.
#[derive(Clone, Debug)]
pub struct CreateUploadResult {
    pub metadata: StorageMetadata,
    pub block_size: i64,
}

/// What the provider returned for one uploaded part.
#[derive(Clone, Debug)]
pub struct PartReceipt {
    pub etag: String,
    pub checksum_sha256: String,
}

/// One entry of the CompleteMultipartUpload manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartChecksum {
    pub part_number: i64,
    pub etag: String,
    /// Base64-encoded SHA-256 of the part's bytes.
    pub checksum_sha256: String,
}

/// Result of finalizing the multipart upload.
#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub location: String,
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub checksum: String,
}

/// Callback receiving the running byte count sent for the current part.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Provider-facing operations of one backend session.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Ensure the destination container (bucket) exists. Owning it already
    /// is success.
    async fn create_container(&self) -> BackendResult<()>;

    /// Initiate the multipart session for `task_key` and recommend a block
    /// size for a file of `file_size` bytes.
    async fn create_upload_resource(
        &self,
        task_key: &str,
        file_size: i64,
    ) -> BackendResult<CreateUploadResult>;

    /// Upload one part. `progress` observes the running byte count of the
    /// part body as it is sent.
    async fn upload_part(
        &self,
        handle: &UploadHandle,
        part_number: i64,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendResult<PartReceipt>;

    /// Finalize the upload with the manifest of completed parts.
    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[PartChecksum],
        file_size: i64,
    ) -> BackendResult<CompletedUpload>;

    /// Recommended block size for a file of the given size.
    fn optimal_block_size(&self, file_size: i64) -> i64;

    /// Validate a block size against provider limits.
    fn validate_block_size(&self, block_size: i64, file_size: i64) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let handle = UploadHandle {
            upload_id: "uid".to_string(),
            bucket: "bucket".to_string(),
            key: "1-ab-1700000000000".to_string(),
            checksum_algorithm: "SHA256".to_string(),
            checksum_type: "COMPOSITE".to_string(),
            server_side_encryption: String::new(),
        };
        let metadata = handle.to_metadata().unwrap();
        assert_eq!(metadata.schema_version, METADATA_SCHEMA_VERSION);

        let decoded = UploadHandle::from_metadata(&metadata.json, metadata.schema_version).unwrap();
        assert_eq!(decoded.upload_id, "uid");
        assert_eq!(decoded.key, "1-ab-1700000000000");
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let err = UploadHandle::from_metadata("{}", 99).unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }
}
