//! Database models mapping to the catalogue schema.
//!
//! Status columns are TEXT in the database; the enums here serialize to
//! their canonical strings only at the store boundary.

use sqlx::FromRow;
use stowage_core::checksum;
use time::OffsetDateTime;

/// Task lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Archiving,
    ArchivePaused,
    ArchiveAborted,
    ArchiveCompleted,
    Uploading,
    UploadPaused,
    UploadAborted,
    UploadCompleted,
}

/// Upload lifecycle states. `Completed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Aborted,
    Failed,
}

/// Block lifecycle states. `Complete` is terminal; `Error` stays eligible
/// for re-claiming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    Queued,
    Running,
    Complete,
    Error,
}

/// Task record: one end-user intent to archive and upload a directory.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub input_path: String,
    pub output_path: String,
    pub config_path: String,
    pub provider: String,
    pub archive_format: String,
    pub status: TaskStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub content_hash: String,
    pub size: i64,
    pub file_count: i64,
    pub archived_file_count: i64,
}

impl TaskRow {
    /// Durable object key for this task's upload. Stable across restarts:
    /// `<id>-<hex(content_hash)>-<created_at_millis>`.
    pub fn key(&self) -> String {
        let millis = self.created_at.unix_timestamp_nanos() / 1_000_000;
        format!(
            "{}-{}-{}",
            self.id,
            checksum::hex_encode(self.content_hash.as_bytes()),
            millis
        )
    }
}

/// Input for task creation.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub input_path: String,
    pub output_path: String,
    pub config_path: String,
    pub provider: String,
    pub archive_format: String,
    pub content_hash: String,
    pub size: i64,
    pub file_count: i64,
}

/// Upload record: bookkeeping for one multipart transaction.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: i64,
    pub task_id: i64,
    pub metadata_json: String,
    pub metadata_schema_version: i64,
    pub file_path: String,
    pub file_size: i64,
    pub file_last_modified_at: OffsetDateTime,
    pub uploaded_bytes: i64,
    pub uploaded_blocks: i64,
    pub total_blocks: i64,
    pub block_size: i64,
    pub status: UploadStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub location: Option<String>,
}

/// Input for upload creation.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub task_id: i64,
    pub metadata_json: String,
    pub metadata_schema_version: i64,
    pub file_path: String,
    pub file_size: i64,
    pub file_last_modified_at: OffsetDateTime,
    pub total_blocks: i64,
    pub block_size: i64,
}

/// Block record: one numbered part of an upload. `block_number` is the
/// wire part number, dense and 1-based within its upload.
#[derive(Debug, Clone, FromRow)]
pub struct UploadBlockRow {
    pub id: i64,
    pub upload_id: i64,
    pub block_number: i64,
    pub file_offset: i64,
    pub size: i64,
    pub status: BlockStatus,
    pub etag: Option<String>,
    pub checksum: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub uploaded_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub error_count: i64,
}

/// File catalogue entry captured at archive-plan time for the browsing UI.
#[derive(Debug, Clone, FromRow)]
pub struct FileCatalogRow {
    pub id: i64,
    pub task_id: i64,
    pub full_path: String,
    pub name: String,
    pub parent_path: Option<String>,
    pub file_type: String,
    pub size_bytes: i64,
    pub modified_at: Option<OffsetDateTime>,
}

/// Input for file catalogue population.
#[derive(Debug, Clone)]
pub struct NewFileCatalogEntry {
    pub full_path: String,
    pub name: String,
    pub parent_path: Option<String>,
    pub file_type: String,
    pub size_bytes: i64,
    pub modified_at: Option<OffsetDateTime>,
}
