//! SQLite-backed catalogue store.

use crate::error::{CatalogError, CatalogResult};
use crate::models::{
    BlockStatus, FileCatalogRow, NewFileCatalogEntry, NewTask, NewUpload, TaskRow, TaskStatus,
    UploadBlockRow, UploadRow, UploadStatus,
};
use crate::repos::{BlockRepo, Catalog, FileCatalogRepo, TaskRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// SQLite parameter ceiling is 999; block inserts carry 7 values per row.
const INSERT_BATCH_ROWS: usize = 128;

/// SQLite-based catalogue.
pub struct SqliteCatalog {
    pool: Pool<Sqlite>,
}

impl SqliteCatalog {
    /// Open (or create) the catalogue database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(CatalogError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers; claim/mark primitives
            // rely on this for their atomicity guarantees.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn migrate(&self) -> CatalogResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRepo for SqliteCatalog {
    async fn create_task(&self, task: &NewTask) -> CatalogResult<i64> {
        match self
            .find_similar_task(
                &task.input_path,
                &task.provider,
                &task.content_hash,
                &task.archive_format,
            )
            .await
        {
            Ok(existing) => {
                tracing::debug!(task_id = existing.id, "equivalent task already exists");
                return Ok(existing.id);
            }
            Err(CatalogError::DoesNotExist) => {}
            Err(e) => return Err(e),
        }

        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                input_path, output_path, config_path, provider, archive_format,
                status, created_at, updated_at, content_hash, size, file_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.input_path)
        .bind(&task.output_path)
        .bind(&task.config_path)
        .bind(&task.provider)
        .bind(&task.archive_format)
        .bind(TaskStatus::Queued)
        .bind(now)
        .bind(now)
        .bind(&task.content_hash)
        .bind(task.size)
        .bind(task.file_count)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_similar_task(
        &self,
        input_path: &str,
        provider: &str,
        content_hash: &str,
        archive_format: &str,
    ) -> CatalogResult<TaskRow> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE input_path = ? AND provider = ? AND content_hash = ? AND archive_format = ?
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(input_path)
        .bind(provider)
        .bind(content_hash)
        .bind(archive_format)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(CatalogError::DoesNotExist)
    }

    async fn get_task(&self, id: i64) -> CatalogResult<TaskRow> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(CatalogError::DoesNotExist)
    }

    async fn list_tasks(&self) -> CatalogResult<Vec<TaskRow>> {
        let rows = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn update_task_status(&self, id: i64, status: TaskStatus) -> CatalogResult<()> {
        let result = sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(CatalogError::Integrity(format!(
                "expected 1 task row update, got {}",
                result.rows_affected()
            )));
        }
        tracing::debug!(task_id = id, status = ?status, "task status updated");
        Ok(())
    }

    async fn update_task_content_info(
        &self,
        id: i64,
        content_hash: &str,
        size: i64,
        file_count: i64,
    ) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET content_hash = ?, size = ?, file_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(content_hash)
        .bind(size)
        .bind(file_count)
        .bind(OffsetDateTime::now_utc())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(CatalogError::Integrity(format!(
                "expected 1 task row update, got {}",
                result.rows_affected()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl UploadRepo for SqliteCatalog {
    async fn create_upload(&self, upload: &NewUpload) -> CatalogResult<i64> {
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(
            r#"
            INSERT INTO uploads (
                task_id, metadata_json, metadata_schema_version,
                file_path, file_size, file_last_modified_at,
                total_blocks, block_size, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO NOTHING
            "#,
        )
        .bind(upload.task_id)
        .bind(&upload.metadata_json)
        .bind(upload.metadata_schema_version)
        .bind(&upload.file_path)
        .bind(upload.file_size)
        .bind(upload.file_last_modified_at)
        .bind(upload.total_blocks)
        .bind(upload.block_size)
        .bind(UploadStatus::Queued)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Conflict: the task already has an upload; its original
            // metadata wins.
            let existing = self.get_upload_by_task(upload.task_id).await?;
            return Ok(existing.id);
        }
        Ok(result.last_insert_rowid())
    }

    async fn get_upload(&self, id: i64) -> CatalogResult<UploadRow> {
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(CatalogError::DoesNotExist)
    }

    async fn get_upload_by_task(&self, task_id: i64) -> CatalogResult<UploadRow> {
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(CatalogError::DoesNotExist)
    }

    async fn update_upload_status(&self, id: i64, status: UploadStatus) -> CatalogResult<()> {
        let result = sqlx::query("UPDATE uploads SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(CatalogError::Integrity(format!(
                "expected 1 upload row update, got {}",
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn mark_upload_complete(&self, id: i64, location: &str) -> CatalogResult<()> {
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET status = ?, location = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(UploadStatus::Completed)
        .bind(location)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(CatalogError::Integrity(format!(
                "expected 1 upload row update, got {}",
                result.rows_affected()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockRepo for SqliteCatalog {
    async fn create_upload_blocks(
        &self,
        upload_id: i64,
        file_size: i64,
        block_size: i64,
    ) -> CatalogResult<i64> {
        if block_size <= 0 {
            return Err(CatalogError::InvalidArgument(
                "block size must be > 0".to_string(),
            ));
        }

        let existing = self.block_size_sum(upload_id).await?;
        if existing == file_size {
            tracing::info!(upload_id, "blocks already materialized, skipping");
            return Ok(0);
        }

        let total_blocks = (file_size + block_size - 1) / block_size;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.pool.begin().await?;
        let mut created = 0i64;
        let mut block_number = 1i64;
        while block_number <= total_blocks {
            let batch_end = (block_number + INSERT_BATCH_ROWS as i64 - 1).min(total_blocks);
            let rows = (batch_end - block_number + 1) as usize;
            let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?)"; rows].join(", ");
            let sql = format!(
                "INSERT INTO upload_blocks \
                 (upload_id, block_number, file_offset, size, status, created_at, updated_at) \
                 VALUES {placeholders}"
            );
            let mut query = sqlx::query(&sql);
            for n in block_number..=batch_end {
                let offset = (n - 1) * block_size;
                let size = if n == total_blocks {
                    file_size - offset
                } else {
                    block_size
                };
                query = query
                    .bind(upload_id)
                    .bind(n)
                    .bind(offset)
                    .bind(size)
                    .bind(BlockStatus::Queued)
                    .bind(now)
                    .bind(now);
            }
            let result = query.execute(&mut *tx).await?;
            created += result.rows_affected() as i64;
            block_number = batch_end + 1;
        }
        tx.commit().await?;

        tracing::debug!(upload_id, created, "materialized upload blocks");
        Ok(created)
    }

    async fn block_size_sum(&self, upload_id: i64) -> CatalogResult<i64> {
        let sum: Option<i64> =
            sqlx::query_scalar("SELECT SUM(size) FROM upload_blocks WHERE upload_id = ?")
                .bind(upload_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(sum.unwrap_or(0))
    }

    async fn get_block(&self, id: i64) -> CatalogResult<UploadBlockRow> {
        let row = sqlx::query_as::<_, UploadBlockRow>("SELECT * FROM upload_blocks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(CatalogError::DoesNotExist)
    }

    async fn claim_next_unfinished(&self, upload_id: i64, limit: i64) -> CatalogResult<Vec<i64>> {
        // SELECT and UPDATE run inside one transaction on the single
        // serialized connection, so concurrent claims see disjoint sets.
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM upload_blocks
            WHERE upload_id = ? AND status IN (?, ?)
            ORDER BY block_number ASC LIMIT ?
            "#,
        )
        .bind(upload_id)
        .bind(BlockStatus::Queued)
        .bind(BlockStatus::Error)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(ids);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE upload_blocks SET status = ?, updated_at = ? WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql)
            .bind(BlockStatus::Running)
            .bind(OffsetDateTime::now_utc());
        for id in &ids {
            query = query.bind(*id);
        }
        let result = query.execute(&mut *tx).await?;
        if result.rows_affected() != ids.len() as u64 {
            return Err(CatalogError::Integrity(format!(
                "claimed {} blocks but updated {}",
                ids.len(),
                result.rows_affected()
            )));
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn reset_dirty(&self, upload_id: i64) -> CatalogResult<u64> {
        let result = sqlx::query(
            "UPDATE upload_blocks SET status = ?, updated_at = ? WHERE upload_id = ? AND status = ?",
        )
        .bind(BlockStatus::Queued)
        .bind(OffsetDateTime::now_utc())
        .bind(upload_id)
        .bind(BlockStatus::Running)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_complete(
        &self,
        upload_id: i64,
        block_id: i64,
        checksum: &str,
        etag: &str,
    ) -> CatalogResult<()> {
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(
            r#"
            UPDATE upload_blocks
            SET checksum = ?, etag = ?, status = ?, uploaded_at = ?, updated_at = ?
            WHERE id = ? AND upload_id = ?
            "#,
        )
        .bind(checksum)
        .bind(etag)
        .bind(BlockStatus::Complete)
        .bind(now)
        .bind(now)
        .bind(block_id)
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(CatalogError::Integrity(format!(
                "no block with id {block_id} for upload {upload_id}"
            )));
        }
        Ok(())
    }

    async fn mark_error(
        &self,
        upload_id: i64,
        block_id: i64,
        message: &str,
    ) -> CatalogResult<i64> {
        let result = sqlx::query(
            r#"
            UPDATE upload_blocks
            SET status = ?, last_error = ?, error_count = error_count + 1, updated_at = ?
            WHERE id = ? AND upload_id = ?
            "#,
        )
        .bind(BlockStatus::Error)
        .bind(message)
        .bind(OffsetDateTime::now_utc())
        .bind(block_id)
        .bind(upload_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(CatalogError::Integrity(format!(
                "no block with id {block_id} for upload {upload_id}"
            )));
        }

        let error_count: i64 =
            sqlx::query_scalar("SELECT error_count FROM upload_blocks WHERE id = ?")
                .bind(block_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(error_count)
    }

    async fn completed_blocks(&self, upload_id: i64) -> CatalogResult<Vec<UploadBlockRow>> {
        let rows = sqlx::query_as::<_, UploadBlockRow>(
            r#"
            SELECT * FROM upload_blocks
            WHERE upload_id = ? AND status = ?
            ORDER BY block_number ASC
            "#,
        )
        .bind(upload_id)
        .bind(BlockStatus::Complete)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl FileCatalogRepo for SqliteCatalog {
    async fn replace_file_catalog(
        &self,
        task_id: i64,
        entries: &[NewFileCatalogEntry],
    ) -> CatalogResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM file_catalog WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO file_catalog
                    (task_id, full_path, name, parent_path, file_type, size_bytes, modified_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task_id)
            .bind(&entry.full_path)
            .bind(&entry.name)
            .bind(&entry.parent_path)
            .bind(&entry.file_type)
            .bind(entry.size_bytes)
            .bind(entry.modified_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_file_catalog(&self, task_id: i64) -> CatalogResult<Vec<FileCatalogRow>> {
        let rows = sqlx::query_as::<_, FileCatalogRow>(
            "SELECT * FROM file_catalog WHERE task_id = ? ORDER BY full_path",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

const SCHEMA_SQL: &str = r#"
-- Tasks: one row per declared archive+upload intent
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,

    input_path TEXT NOT NULL,
    output_path TEXT NOT NULL,
    config_path TEXT NOT NULL,

    provider TEXT NOT NULL,
    archive_format TEXT NOT NULL,

    status TEXT NOT NULL DEFAULT 'QUEUED',

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    file_count INTEGER NOT NULL,
    archived_file_count INTEGER NOT NULL DEFAULT 0
);

-- Uploads: exactly one multipart transaction per archived task
CREATE TABLE IF NOT EXISTS uploads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,

    task_id INTEGER NOT NULL UNIQUE,

    metadata_json TEXT NOT NULL,
    metadata_schema_version INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    file_last_modified_at TEXT NOT NULL,

    uploaded_bytes INTEGER NOT NULL DEFAULT 0,
    uploaded_blocks INTEGER NOT NULL DEFAULT 0,
    total_blocks INTEGER NOT NULL,
    block_size INTEGER NOT NULL,

    status TEXT NOT NULL DEFAULT 'QUEUED',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    location TEXT,

    FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_uploads_status ON uploads(status, task_id);

-- Upload blocks: one row per numbered part. block_number is the wire part
-- number, dense and 1-based within its upload.
CREATE TABLE IF NOT EXISTS upload_blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,

    upload_id INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    file_offset INTEGER NOT NULL,
    size INTEGER NOT NULL,

    status TEXT NOT NULL DEFAULT 'QUEUED',
    etag TEXT,
    checksum TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    uploaded_at TEXT,
    last_error TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,

    UNIQUE(upload_id, block_number),
    FOREIGN KEY(upload_id) REFERENCES uploads(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_upload_blocks_claim ON upload_blocks(upload_id, status);

-- Roll the completed block into the parent upload's counters inside the
-- same transaction as the status flip.
CREATE TRIGGER IF NOT EXISTS trg_upload_progress
AFTER UPDATE OF status ON upload_blocks
WHEN NEW.status = 'COMPLETE' AND OLD.status <> 'COMPLETE'
BEGIN
    UPDATE uploads
    SET uploaded_bytes = uploaded_bytes + NEW.size,
        uploaded_blocks = uploaded_blocks + 1,
        updated_at = NEW.updated_at
    WHERE id = NEW.upload_id;
END;

-- File catalogue captured at archive-plan time for the browsing UI
CREATE TABLE IF NOT EXISTS file_catalog (
    id INTEGER PRIMARY KEY AUTOINCREMENT,

    task_id INTEGER NOT NULL,

    full_path TEXT NOT NULL,
    name TEXT NOT NULL,
    parent_path TEXT,
    file_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    modified_at TEXT,

    FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_file_catalog_task ON file_catalog(task_id);
"#;
