//! Scheduler and orchestrator tests against an in-memory backend.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use stowage_backend::client::composite_checksum;
use stowage_backend::{
    BackendError, BackendResult, CompletedUpload, CreateUploadResult, PartChecksum, PartReceipt,
    ProgressFn, StorageBackend, UploadHandle,
};
use stowage_catalog::models::{NewTask, NewUpload, TaskStatus, UploadStatus};
use stowage_catalog::{BlockRepo, Catalog, SqliteCatalog, TaskRepo, UploadRepo};
use stowage_core::checksum::{base64_encode, sha256};
use stowage_core::config::{AppConfig, ArchiveFormat, Provider};
use stowage_engine::scheduler::run_upload;
use stowage_engine::{EngineError, Orchestrator};
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// In-memory stand-in for the S3 backend.
struct FakeBackend {
    block_size: i64,
    parts: Mutex<HashMap<i64, Vec<u8>>>,
    attempts: Mutex<HashMap<i64, usize>>,
    /// part number -> remaining retryable failures to inject
    failures: Mutex<HashMap<i64, usize>>,
    /// part number that fails fatally on every attempt
    fatal_part: Option<i64>,
    /// initiate-multipart fails with ClockSkew
    fatal_initiate: bool,
}

impl FakeBackend {
    fn new(block_size: i64) -> Self {
        Self {
            block_size,
            parts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            fatal_part: None,
            fatal_initiate: false,
        }
    }

    fn failing_once(self, part: i64) -> Self {
        self.failures.lock().unwrap().insert(part, 1);
        self
    }

    fn attempts_for(&self, part: i64) -> usize {
        self.attempts.lock().unwrap().get(&part).copied().unwrap_or(0)
    }

    fn assembled(&self) -> Vec<u8> {
        let parts = self.parts.lock().unwrap();
        let mut numbers: Vec<i64> = parts.keys().copied().collect();
        numbers.sort();
        numbers
            .iter()
            .flat_map(|n| parts[n].iter().copied())
            .collect()
    }

    fn handle() -> UploadHandle {
        UploadHandle {
            upload_id: "fake-upload-id".to_string(),
            bucket: "fake-bucket".to_string(),
            key: "fake-key".to_string(),
            checksum_algorithm: "SHA256".to_string(),
            checksum_type: "COMPOSITE".to_string(),
            server_side_encryption: String::new(),
        }
    }
}

#[async_trait]
impl StorageBackend for FakeBackend {
    async fn create_container(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn create_upload_resource(
        &self,
        _task_key: &str,
        _file_size: i64,
    ) -> BackendResult<CreateUploadResult> {
        if self.fatal_initiate {
            return Err(BackendError::ClockSkew);
        }
        Ok(CreateUploadResult {
            metadata: Self::handle().to_metadata()?,
            block_size: self.block_size,
        })
    }

    async fn upload_part(
        &self,
        _handle: &UploadHandle,
        part_number: i64,
        body: Bytes,
        progress: Option<ProgressFn>,
    ) -> BackendResult<PartReceipt> {
        *self.attempts.lock().unwrap().entry(part_number).or_insert(0) += 1;

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Backend {
                    code: "InternalError".to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }
        if self.fatal_part == Some(part_number) {
            return Err(BackendError::ClockSkew);
        }

        if let Some(progress) = progress {
            progress(body.len() as u64);
        }
        let checksum = base64_encode(&sha256(&body));
        self.parts.lock().unwrap().insert(part_number, body.to_vec());
        Ok(PartReceipt {
            etag: format!("\"etag-{part_number}\""),
            checksum_sha256: checksum,
        })
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: &[PartChecksum],
        _file_size: i64,
    ) -> BackendResult<CompletedUpload> {
        let stored = self.parts.lock().unwrap();
        assert_eq!(stored.len(), parts.len(), "manifest must cover all parts");
        Ok(CompletedUpload {
            location: format!("https://{}.example/{}", handle.bucket, handle.key),
            bucket: handle.bucket.clone(),
            key: handle.key.clone(),
            etag: "\"fake-etag\"".to_string(),
            checksum: composite_checksum(parts)?,
        })
    }

    fn optimal_block_size(&self, _file_size: i64) -> i64 {
        self.block_size
    }

    fn validate_block_size(&self, _block_size: i64, _file_size: i64) -> BackendResult<()> {
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    catalog: Arc<SqliteCatalog>,
    upload_id: i64,
    task_id: i64,
}

/// Seed a catalogue with one task and one upload over a scratch file of
/// `content`, split into `block_size`-sized blocks.
async fn fixture(content: &[u8], block_size: i64) -> Fixture {
    let dir = TempDir::new().unwrap();
    let file_path = dir.path().join("archive.tar.gz");
    let mut file = std::fs::File::create(&file_path).unwrap();
    file.write_all(content).unwrap();

    let catalog = Arc::new(
        SqliteCatalog::new(dir.path().join("catalog.db"))
            .await
            .unwrap(),
    );
    let task_id = catalog
        .create_task(&NewTask {
            input_path: "/data/input".to_string(),
            output_path: file_path.display().to_string(),
            config_path: "/etc/stowage.toml".to_string(),
            provider: "aws".to_string(),
            archive_format: "targz".to_string(),
            content_hash: "cafe".to_string(),
            size: content.len() as i64,
            file_count: 1,
        })
        .await
        .unwrap();

    let file_size = content.len() as i64;
    let upload_id = catalog
        .create_upload(&NewUpload {
            task_id,
            metadata_json: FakeBackend::handle().to_metadata().unwrap().json,
            metadata_schema_version: 1,
            file_path: file_path.display().to_string(),
            file_size,
            file_last_modified_at: OffsetDateTime::now_utc(),
            total_blocks: (file_size + block_size - 1) / block_size,
            block_size,
        })
        .await
        .unwrap();

    Fixture {
        _dir: dir,
        catalog,
        upload_id,
        task_id,
    }
}

async fn run(fixture: &Fixture, backend: Arc<FakeBackend>, jobs: usize) -> Result<(), EngineError> {
    let upload = fixture.catalog.get_upload(fixture.upload_id).await.unwrap();
    let catalog: Arc<dyn Catalog> = Arc::clone(&fixture.catalog) as Arc<dyn Catalog>;
    run_upload(
        catalog,
        backend,
        &upload,
        &FakeBackend::handle(),
        jobs,
        false,
        CancellationToken::new(),
    )
    .await
}

#[tokio::test]
async fn single_block_file_uploads_once() {
    let content = vec![7u8; 1000];
    let fixture = fixture(&content, 4096).await;
    let backend = Arc::new(FakeBackend::new(4096));

    run(&fixture, Arc::clone(&backend), 1).await.unwrap();

    assert_eq!(backend.attempts_for(1), 1);
    assert_eq!(backend.assembled(), content);

    let upload = fixture.catalog.get_upload(fixture.upload_id).await.unwrap();
    assert_eq!(upload.uploaded_blocks, 1);
    assert_eq!(upload.uploaded_bytes, 1000);
}

#[tokio::test]
async fn remainder_block_carries_the_tail() {
    let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let fixture = fixture(&content, 1000).await;
    let backend = Arc::new(FakeBackend::new(1000));

    run(&fixture, Arc::clone(&backend), 2).await.unwrap();

    let parts = backend.parts.lock().unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[&1].len(), 1000);
    assert_eq!(parts[&2].len(), 1000);
    assert_eq!(parts[&3].len(), 500);
    drop(parts);
    assert_eq!(backend.assembled(), content);
}

#[tokio::test]
async fn resume_skips_blocks_completed_by_an_earlier_run() {
    let content = vec![42u8; 5000];
    let fixture = fixture(&content, 1000).await;

    // Simulate an interrupted earlier run: 5 blocks exist, two are
    // COMPLETE, one died mid-flight and is stuck RUNNING.
    fixture
        .catalog
        .create_upload_blocks(fixture.upload_id, 5000, 1000)
        .await
        .unwrap();
    let ids = fixture
        .catalog
        .claim_next_unfinished(fixture.upload_id, 3)
        .await
        .unwrap();
    for id in &ids[..2] {
        fixture
            .catalog
            .mark_complete(fixture.upload_id, *id, "aGFzaA==", "\"done\"")
            .await
            .unwrap();
    }

    let backend = Arc::new(FakeBackend::new(1000));
    run(&fixture, Arc::clone(&backend), 2).await.unwrap();

    // Blocks 1 and 2 were never re-sent.
    assert_eq!(backend.attempts_for(1), 0);
    assert_eq!(backend.attempts_for(2), 0);
    assert_eq!(backend.attempts_for(3), 1);
    assert_eq!(backend.attempts_for(4), 1);
    assert_eq!(backend.attempts_for(5), 1);

    let upload = fixture.catalog.get_upload(fixture.upload_id).await.unwrap();
    assert_eq!(upload.uploaded_blocks, 5);
    assert_eq!(upload.uploaded_bytes, 5000);
}

#[tokio::test]
async fn retryable_failure_is_recorded_and_retried() {
    let content = vec![1u8; 3000];
    let fixture = fixture(&content, 1000).await;
    let backend = Arc::new(FakeBackend::new(1000).failing_once(2));

    run(&fixture, Arc::clone(&backend), 1).await.unwrap();

    assert_eq!(backend.attempts_for(2), 2);
    let blocks = fixture
        .catalog
        .completed_blocks(fixture.upload_id)
        .await
        .unwrap();
    assert_eq!(blocks.len(), 3);
    let retried = blocks.iter().find(|b| b.block_number == 2).unwrap();
    assert_eq!(retried.error_count, 1);
    assert_eq!(retried.last_error.as_deref(), Some("provider error InternalError: injected failure"));
}

#[tokio::test]
async fn fatal_error_aborts_the_run() {
    let content = vec![1u8; 3000];
    let fixture = fixture(&content, 1000).await;
    let mut backend = FakeBackend::new(1000);
    backend.fatal_part = Some(1);
    let backend = Arc::new(backend);

    let err = run(&fixture, Arc::clone(&backend), 1).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Backend(BackendError::ClockSkew)
    ));

    let blocks = fixture
        .catalog
        .completed_blocks(fixture.upload_id)
        .await
        .unwrap();
    assert!((blocks.len() as i64) < 3, "run must not complete all blocks");
}

#[tokio::test]
async fn cancelled_run_returns_cancelled_with_state_intact() {
    let content = vec![1u8; 3000];
    let fixture = fixture(&content, 1000).await;
    let backend = Arc::new(FakeBackend::new(1000));

    let upload = fixture.catalog.get_upload(fixture.upload_id).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = run_upload(
        Arc::clone(&fixture.catalog) as Arc<dyn Catalog>,
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        &upload,
        &FakeBackend::handle(),
        1,
        false,
        cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(backend.attempts_for(1), 0);

    // Blocks exist and are all claimable by the next run.
    let ids = fixture
        .catalog
        .claim_next_unfinished(fixture.upload_id, 16)
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
}

// ---------------------------------------------------------------------------
// Orchestrator end-to-end
// ---------------------------------------------------------------------------

async fn orchestrated_fixture() -> (TempDir, Arc<SqliteCatalog>, i64) {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("tree");
    std::fs::create_dir_all(input.join("nested")).unwrap();
    std::fs::write(input.join("a.bin"), vec![9u8; 4096]).unwrap();
    std::fs::write(input.join("nested/b.bin"), vec![3u8; 1024]).unwrap();

    let catalog = Arc::new(
        SqliteCatalog::new(dir.path().join("catalog.db"))
            .await
            .unwrap(),
    );
    let task_id = catalog
        .create_task(&NewTask {
            input_path: input.display().to_string(),
            output_path: dir.path().join("tree.tar.gz").display().to_string(),
            config_path: dir.path().join("config.toml").display().to_string(),
            provider: "aws".to_string(),
            archive_format: "targz".to_string(),
            content_hash: String::new(),
            size: 0,
            file_count: 0,
        })
        .await
        .unwrap();
    (dir, catalog, task_id)
}

fn test_config() -> AppConfig {
    AppConfig {
        provider: Provider::Aws,
        archive_format: ArchiveFormat::TarGz,
        aws: None,
    }
}

#[tokio::test]
async fn orchestrator_runs_a_task_end_to_end() {
    let (dir, catalog, task_id) = orchestrated_fixture().await;
    let backend = Arc::new(FakeBackend::new(1024));

    let orchestrator = Orchestrator::new(
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        test_config(),
        CancellationToken::new(),
    )
    .quiet();

    orchestrator
        .run_task_with_backend(task_id, 2, Arc::clone(&backend) as Arc<dyn StorageBackend>)
        .await
        .unwrap();

    let task = catalog.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::UploadCompleted);
    assert_ne!(task.content_hash, "");

    let upload = catalog.get_upload_by_task(task_id).await.unwrap();
    assert_eq!(upload.status, UploadStatus::Completed);
    assert_eq!(
        upload.location.as_deref(),
        Some("https://fake-bucket.example/fake-key")
    );
    assert!(upload.completed_at.is_some());
    assert_eq!(upload.uploaded_bytes, upload.file_size);
    assert_eq!(upload.uploaded_blocks, upload.total_blocks);

    // The bytes the backend received are exactly the archive on disk.
    let archive = std::fs::read(dir.path().join("tree.tar.gz")).unwrap();
    assert_eq!(backend.assembled(), archive);
}

#[tokio::test]
async fn rerunning_a_completed_task_sends_nothing_new() {
    let (_dir, catalog, task_id) = orchestrated_fixture().await;
    let backend = Arc::new(FakeBackend::new(1024));
    let orchestrator = Orchestrator::new(
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        test_config(),
        CancellationToken::new(),
    )
    .quiet();

    orchestrator
        .run_task_with_backend(task_id, 1, Arc::clone(&backend) as Arc<dyn StorageBackend>)
        .await
        .unwrap();
    let upload = catalog.get_upload_by_task(task_id).await.unwrap();
    let attempts_after_first: usize =
        (1..=upload.total_blocks).map(|n| backend.attempts_for(n)).sum();

    orchestrator
        .run_task_with_backend(task_id, 1, Arc::clone(&backend) as Arc<dyn StorageBackend>)
        .await
        .unwrap();
    let attempts_after_second: usize =
        (1..=upload.total_blocks).map(|n| backend.attempts_for(n)).sum();

    assert_eq!(attempts_after_first, attempts_after_second);
}

#[tokio::test]
async fn clock_skew_on_initiate_leaves_no_upload_row() {
    let (_dir, catalog, task_id) = orchestrated_fixture().await;
    let mut backend = FakeBackend::new(1024);
    backend.fatal_initiate = true;
    let backend = Arc::new(backend);

    let orchestrator = Orchestrator::new(
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        test_config(),
        CancellationToken::new(),
    )
    .quiet();

    let err = orchestrator
        .run_task_with_backend(task_id, 1, backend as Arc<dyn StorageBackend>)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Backend(BackendError::ClockSkew)
    ));

    assert!(matches!(
        catalog.get_upload_by_task(task_id).await,
        Err(stowage_catalog::CatalogError::DoesNotExist)
    ));
}

#[tokio::test]
async fn completed_parts_yield_the_composite_checksum_law() {
    let (_dir, catalog, task_id) = orchestrated_fixture().await;
    let backend = Arc::new(FakeBackend::new(1024));
    let orchestrator = Orchestrator::new(
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        test_config(),
        CancellationToken::new(),
    )
    .quiet();
    orchestrator
        .run_task_with_backend(task_id, 3, Arc::clone(&backend) as Arc<dyn StorageBackend>)
        .await
        .unwrap();

    let upload = catalog.get_upload_by_task(task_id).await.unwrap();
    let blocks = catalog.completed_blocks(upload.id).await.unwrap();

    // Recompute the law by hand from the stored per-part digests.
    let mut concatenated = Vec::new();
    for block in &blocks {
        let raw = stowage_core::checksum::base64_decode(block.checksum.as_ref().unwrap()).unwrap();
        concatenated.extend_from_slice(&raw);
    }
    let expected = format!(
        "{}-{}",
        base64_encode(&sha256(&concatenated)),
        blocks.len()
    );

    let parts: Vec<PartChecksum> = blocks
        .iter()
        .map(|b| PartChecksum {
            part_number: b.block_number,
            etag: b.etag.clone().unwrap(),
            checksum_sha256: b.checksum.clone().unwrap(),
        })
        .collect();
    assert_eq!(composite_checksum(&parts).unwrap(), expected);
}
