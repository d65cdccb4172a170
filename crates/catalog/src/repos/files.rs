//! File catalogue repository.

use crate::error::CatalogResult;
use crate::models::{FileCatalogRow, NewFileCatalogEntry};
use async_trait::async_trait;

/// Repository for the per-task file catalogue consumed by the browsing UI.
#[async_trait]
pub trait FileCatalogRepo: Send + Sync {
    /// Replace the catalogue of a task with freshly walked entries.
    async fn replace_file_catalog(
        &self,
        task_id: i64,
        entries: &[NewFileCatalogEntry],
    ) -> CatalogResult<()>;

    /// List a task's catalogue ordered by path.
    async fn list_file_catalog(&self, task_id: i64) -> CatalogResult<Vec<FileCatalogRow>>;
}
