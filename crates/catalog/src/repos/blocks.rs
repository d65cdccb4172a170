//! Upload-block repository.
//!
//! Block rows drive the scheduler: claim moves QUEUED/ERROR rows to
//! RUNNING so exactly one worker owns each, mark_complete fires the
//! progress roll-up trigger, and reset_dirty recovers rows orphaned by a
//! crashed process.

use crate::error::CatalogResult;
use crate::models::UploadBlockRow;
use async_trait::async_trait;

/// Repository for upload-block rows.
#[async_trait]
pub trait BlockRepo: Send + Sync {
    /// Materialize block rows covering `[0, file_size)` in one batched
    /// insert: `ceil(file_size / block_size)` rows, the last sized to the
    /// remainder. Returns the number of rows created, or 0 when the
    /// existing rows already sum to `file_size`. Fails with
    /// `InvalidArgument` when `block_size <= 0`.
    async fn create_upload_blocks(
        &self,
        upload_id: i64,
        file_size: i64,
        block_size: i64,
    ) -> CatalogResult<i64>;

    /// `SUM(size)` over all blocks of an upload (0 when none exist).
    async fn block_size_sum(&self, upload_id: i64) -> CatalogResult<i64>;

    /// Fetch a block by row id.
    async fn get_block(&self, id: i64) -> CatalogResult<UploadBlockRow>;

    /// Atomically select up to `limit` QUEUED or ERROR blocks, transition
    /// them to RUNNING, and return their row ids in block order. Two
    /// concurrent callers never receive the same id.
    async fn claim_next_unfinished(&self, upload_id: i64, limit: i64) -> CatalogResult<Vec<i64>>;

    /// Revert any RUNNING block back to QUEUED. RUNNING rows at startup
    /// are necessarily orphans of an earlier crashed process. Returns the
    /// number of rows reverted.
    async fn reset_dirty(&self, upload_id: i64) -> CatalogResult<u64>;

    /// Record a successful part upload: checksum, etag, COMPLETE status
    /// and uploaded_at. Exactly one row must be affected; the roll-up
    /// trigger advances the parent upload's counters in the same
    /// transaction.
    async fn mark_complete(
        &self,
        upload_id: i64,
        block_id: i64,
        checksum: &str,
        etag: &str,
    ) -> CatalogResult<()>;

    /// Record a failed attempt: ERROR status, message, incremented error
    /// count. Returns the new error count.
    async fn mark_error(
        &self,
        upload_id: i64,
        block_id: i64,
        message: &str,
    ) -> CatalogResult<i64>;

    /// All COMPLETE blocks of an upload, ordered by block number
    /// ascending. The composite checksum depends on this ordering.
    async fn completed_blocks(&self, upload_id: i64) -> CatalogResult<Vec<UploadBlockRow>>;
}
