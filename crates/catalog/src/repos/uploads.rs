//! Upload repository.

use crate::error::CatalogResult;
use crate::models::{NewUpload, UploadRow, UploadStatus};
use async_trait::async_trait;

/// Repository for upload rows.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create an upload for a task. Idempotent on task_id: a second call
    /// returns the existing id and leaves the original row untouched.
    async fn create_upload(&self, upload: &NewUpload) -> CatalogResult<i64>;

    /// Fetch an upload by id.
    async fn get_upload(&self, id: i64) -> CatalogResult<UploadRow>;

    /// Fetch the upload belonging to a task.
    async fn get_upload_by_task(&self, task_id: i64) -> CatalogResult<UploadRow>;

    /// Update the upload status.
    async fn update_upload_status(&self, id: i64, status: UploadStatus) -> CatalogResult<()>;

    /// Mark the upload completed, recording the destination URL.
    async fn mark_upload_complete(&self, id: i64, location: &str) -> CatalogResult<()>;
}
