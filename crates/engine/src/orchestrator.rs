//! Upload orchestrator: end-to-end flow for one task.

use crate::archive::{Archiver, TarGzArchiver};
use crate::error::{EngineError, EngineResult};
use crate::file_io;
use crate::scheduler;
use std::path::Path;
use std::sync::Arc;
use stowage_backend::{backend_for_provider, PartChecksum, StorageBackend, UploadHandle};
use stowage_catalog::models::{NewUpload, TaskRow, TaskStatus, UploadRow, UploadStatus};
use stowage_catalog::{Catalog, CatalogError};
use stowage_core::config::AppConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Drives a task from catalogue row to completed upload.
pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    config: AppConfig,
    cancel: CancellationToken,
    show_progress: bool,
}

impl Orchestrator {
    pub fn new(catalog: Arc<dyn Catalog>, config: AppConfig, cancel: CancellationToken) -> Self {
        Self {
            catalog,
            config,
            cancel,
            show_progress: true,
        }
    }

    /// Disable the terminal progress footer (tests, non-tty runs).
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Run a task end to end with the backend the provider tag selects.
    pub async fn run_task(&self, task_id: i64, max_concurrent_jobs: usize) -> EngineResult<()> {
        let task = self.catalog.get_task(task_id).await?;
        let provider = task
            .provider
            .parse()
            .map_err(|e: stowage_core::Error| EngineError::InvalidState(e.to_string()))?;
        let backend = backend_for_provider(provider, &self.config)?;
        self.run_task_with_backend(task_id, max_concurrent_jobs, backend)
            .await
    }

    /// Same flow with an explicit backend; the seam the tests use.
    pub async fn run_task_with_backend(
        &self,
        task_id: i64,
        max_concurrent_jobs: usize,
        backend: Arc<dyn StorageBackend>,
    ) -> EngineResult<()> {
        let task = self.catalog.get_task(task_id).await?;
        let archiver = TarGzArchiver::new(&task.input_path, &task.output_path);

        self.ensure_archive(&task, &archiver).await?;
        self.checkpoint()?;

        // The archive step may have refreshed the content fingerprint the
        // task key derives from.
        let task = self.catalog.get_task(task_id).await?;

        backend.create_container().await?;
        info!(task_id, "container ready");
        self.checkpoint()?;

        let upload = self.ensure_upload(&task, &*backend, archiver.archive_path()).await?;
        let handle = UploadHandle::from_metadata(&upload.metadata_json, upload.metadata_schema_version)?;

        self.catalog
            .update_upload_status(upload.id, UploadStatus::Uploading)
            .await?;
        self.catalog
            .update_task_status(task.id, TaskStatus::Uploading)
            .await?;

        let run = scheduler::run_upload(
            Arc::clone(&self.catalog),
            Arc::clone(&backend),
            &upload,
            &handle,
            max_concurrent_jobs,
            self.show_progress,
            self.cancel.clone(),
        )
        .await;
        if let Err(e) = run {
            if matches!(e, EngineError::Cancelled) {
                self.catalog
                    .update_upload_status(upload.id, UploadStatus::Aborted)
                    .await?;
                self.catalog
                    .update_task_status(task.id, TaskStatus::UploadAborted)
                    .await?;
            }
            return Err(e);
        }

        let completed = self.finalize(&upload, &handle, &*backend).await?;
        self.catalog
            .mark_upload_complete(upload.id, &completed.location)
            .await?;
        self.catalog
            .update_task_status(task.id, TaskStatus::UploadCompleted)
            .await?;
        info!(task_id, location = %completed.location, "upload completed");
        Ok(())
    }

    /// Validate the existing archive or produce a fresh one.
    async fn ensure_archive(&self, task: &TaskRow, archiver: &TarGzArchiver) -> EngineResult<()> {
        let mut must_rearchive = matches!(
            task.status,
            TaskStatus::Queued
                | TaskStatus::Archiving
                | TaskStatus::ArchivePaused
                | TaskStatus::ArchiveAborted
        );

        if !archiver.is_valid().await {
            info!(task_id = task.id, "no usable archive on disk");
            must_rearchive = true;
        }

        let plan = archiver.plan(self.cancel.clone()).await?;
        if plan.info.size_in_bytes as i64 != task.size {
            info!(task_id = task.id, "input tree changed since last run");
            must_rearchive = true;
        }

        if must_rearchive {
            self.catalog
                .update_task_status(task.id, TaskStatus::Archiving)
                .await?;
            archiver.start(self.cancel.clone()).await?;
            self.catalog
                .update_task_content_info(
                    task.id,
                    &plan.info.content_hash,
                    plan.info.size_in_bytes as i64,
                    plan.info.total_file_count as i64,
                )
                .await?;
            self.catalog
                .replace_file_catalog(task.id, &plan.entries)
                .await?;
            info!(task_id = task.id, files = plan.info.total_file_count, "archive created");
        } else {
            info!(task_id = task.id, "input unchanged, reusing archive");
        }

        self.catalog
            .update_task_status(task.id, TaskStatus::ArchiveCompleted)
            .await?;
        Ok(())
    }

    /// Look up the task's upload, or initiate one with the backend and
    /// persist its metadata and block size.
    async fn ensure_upload(
        &self,
        task: &TaskRow,
        backend: &dyn StorageBackend,
        archive_path: &Path,
    ) -> EngineResult<UploadRow> {
        match self.catalog.get_upload_by_task(task.id).await {
            Ok(existing) => {
                info!(task_id = task.id, upload_id = existing.id, "reusing existing upload");
                Ok(existing)
            }
            Err(CatalogError::DoesNotExist) => {
                let file = file_io::file_info(archive_path)?;
                let file_size = file.size as i64;

                let resource = backend
                    .create_upload_resource(&task.key(), file_size)
                    .await?;
                backend.validate_block_size(resource.block_size, file_size)?;

                let total_blocks = (file_size + resource.block_size - 1) / resource.block_size;
                let upload_id = self
                    .catalog
                    .create_upload(&NewUpload {
                        task_id: task.id,
                        metadata_json: resource.metadata.json.clone(),
                        metadata_schema_version: resource.metadata.schema_version,
                        file_path: archive_path.display().to_string(),
                        file_size,
                        file_last_modified_at: file.modified_at,
                        total_blocks,
                        block_size: resource.block_size,
                    })
                    .await?;
                info!(task_id = task.id, upload_id, total_blocks, "upload registered");
                Ok(self.catalog.get_upload(upload_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Assemble the completion manifest and finalize with the provider.
    async fn finalize(
        &self,
        upload: &UploadRow,
        handle: &UploadHandle,
        backend: &dyn StorageBackend,
    ) -> EngineResult<stowage_backend::CompletedUpload> {
        let blocks = self.catalog.completed_blocks(upload.id).await?;
        if blocks.len() as i64 != upload.total_blocks {
            return Err(EngineError::InvalidState(format!(
                "{} of {} blocks completed, cannot finalize",
                blocks.len(),
                upload.total_blocks
            )));
        }

        let mut parts = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let etag = block.etag.clone().ok_or_else(|| {
                EngineError::InvalidState(format!("block {} has no etag", block.block_number))
            })?;
            let checksum = block.checksum.clone().ok_or_else(|| {
                EngineError::InvalidState(format!("block {} has no checksum", block.block_number))
            })?;
            parts.push(PartChecksum {
                part_number: block.block_number,
                etag,
                checksum_sha256: checksum,
            });
        }

        Ok(backend
            .complete_upload(handle, &parts, upload.file_size)
            .await?)
    }

    fn checkpoint(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}
