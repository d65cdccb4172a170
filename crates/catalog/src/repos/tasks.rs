//! Task repository.

use crate::error::CatalogResult;
use crate::models::{NewTask, TaskRow, TaskStatus};
use async_trait::async_trait;

/// Repository for task rows.
#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Create a task, or return the id of an equivalent existing one.
    ///
    /// Two tasks are equivalent when they share (input_path, provider,
    /// content_hash, archive_format).
    async fn create_task(&self, task: &NewTask) -> CatalogResult<i64>;

    /// Find an equivalent task by the same key as [`create_task`].
    async fn find_similar_task(
        &self,
        input_path: &str,
        provider: &str,
        content_hash: &str,
        archive_format: &str,
    ) -> CatalogResult<TaskRow>;

    /// Fetch a task by id.
    async fn get_task(&self, id: i64) -> CatalogResult<TaskRow>;

    /// List all tasks, newest first.
    async fn list_tasks(&self) -> CatalogResult<Vec<TaskRow>>;

    /// Update the task status. Exactly one row must be affected.
    async fn update_task_status(&self, id: i64, status: TaskStatus) -> CatalogResult<()>;

    /// Refresh a task's recorded content fingerprint, size and file count
    /// after re-archiving. Exactly one row must be affected.
    async fn update_task_content_info(
        &self,
        id: i64,
        content_hash: &str,
        size: i64,
        file_count: i64,
    ) -> CatalogResult<()>;
}
