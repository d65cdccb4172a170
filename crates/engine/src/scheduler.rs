//! Block scheduler: drains unfinished block rows into a bounded channel
//! and drives a fixed pool of upload workers.

use crate::error::{EngineError, EngineResult};
use crate::file_io;
use crate::progress::{ProgressBook, ProgressRenderer};
use std::path::PathBuf;
use std::sync::Arc;
use stowage_backend::{StorageBackend, UploadHandle};
use stowage_catalog::models::UploadRow;
use stowage_catalog::Catalog;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many block ids one claim round fetches; also the channel capacity.
pub const DB_BATCH_SIZE: usize = 16;

/// Run one upload to the point where every block has been attempted.
///
/// Recovery first: RUNNING rows left behind by a dead process revert to
/// QUEUED, and missing block rows are materialized. A producer then claims
/// unfinished ids in batches while exactly `max_concurrent_jobs` workers
/// drain them. Blocks that fail with a retryable error return to the
/// claimable pool; anything fatal cancels the run.
pub async fn run_upload(
    catalog: Arc<dyn Catalog>,
    backend: Arc<dyn StorageBackend>,
    upload: &UploadRow,
    handle: &UploadHandle,
    max_concurrent_jobs: usize,
    show_progress: bool,
    cancel: CancellationToken,
) -> EngineResult<()> {
    let jobs = max_concurrent_jobs.max(1);

    let reset = catalog.reset_dirty(upload.id).await?;
    if reset > 0 {
        info!(upload_id = upload.id, reset, "requeued blocks from an interrupted run");
    }

    catalog
        .create_upload_blocks(upload.id, upload.file_size, upload.block_size)
        .await?;

    let already_sent: i64 = catalog
        .completed_blocks(upload.id)
        .await?
        .iter()
        .map(|b| b.size)
        .sum();

    let book = Arc::new(ProgressBook::new(
        jobs,
        upload.file_size as u64,
        already_sent as u64,
    ));
    let renderer = Arc::new(ProgressRenderer::new(show_progress));

    // Anything fatal inside the run cancels this token; the external token
    // chains into it.
    let run_token = cancel.child_token();

    let (tx, rx) = mpsc::channel::<i64>(DB_BATCH_SIZE);
    let rx = Arc::new(Mutex::new(rx));
    let semaphore = Arc::new(Semaphore::new(jobs));

    let producer = {
        let catalog = Arc::clone(&catalog);
        let run_token = run_token.clone();
        let upload_id = upload.id;
        let total_blocks = upload.total_blocks;
        tokio::spawn(async move {
            loop {
                if run_token.is_cancelled() {
                    break;
                }
                let ids = match catalog
                    .claim_next_unfinished(upload_id, DB_BATCH_SIZE as i64)
                    .await
                {
                    Ok(ids) => ids,
                    Err(e) => return Err(EngineError::Catalog(e)),
                };
                if ids.is_empty() {
                    // Nothing claimable, but in-flight blocks may still
                    // land in ERROR and become claimable again. Only a
                    // fully completed upload ends the loop.
                    let done = match catalog.completed_blocks(upload_id).await {
                        Ok(blocks) => blocks.len() as i64,
                        Err(e) => return Err(EngineError::Catalog(e)),
                    };
                    if done >= total_blocks {
                        break;
                    }
                    tokio::select! {
                        _ = run_token.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                    }
                    continue;
                }
                debug!(upload_id, claimed = ids.len(), "claimed block batch");
                for id in ids {
                    if tx.send(id).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(())
        })
    };

    let mut workers = Vec::with_capacity(jobs);
    for worker_id in 1..=jobs {
        let catalog = Arc::clone(&catalog);
        let backend = Arc::clone(&backend);
        let rx = Arc::clone(&rx);
        let semaphore = Arc::clone(&semaphore);
        let book = Arc::clone(&book);
        let renderer = Arc::clone(&renderer);
        let run_token = run_token.clone();
        let upload_id = upload.id;
        let file_path = PathBuf::from(&upload.file_path);
        let handle = handle.clone();

        workers.push(tokio::spawn(async move {
            loop {
                let block_id = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(block_id) = block_id else { break };

                let permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let result = upload_one_block(
                    &*catalog,
                    &*backend,
                    &handle,
                    upload_id,
                    block_id,
                    worker_id,
                    &file_path,
                    &book,
                    &renderer,
                    &run_token,
                )
                .await;
                drop(permit);

                match result {
                    Ok(()) => {}
                    Err(EngineError::Backend(e)) if e.is_retryable() => {
                        // Recorded on the block already; it stays eligible
                        // for the next claim round.
                        warn!(upload_id, block_id, error = %e, "block attempt failed");
                    }
                    Err(e) => {
                        run_token.cancel();
                        return Err(e);
                    }
                }

                if run_token.is_cancelled() {
                    break;
                }
            }
            Ok(())
        }));
    }

    let mut outcome: EngineResult<()> = Ok(());
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
            Err(e) => {
                if outcome.is_ok() {
                    outcome = Err(EngineError::Io(std::io::Error::other(e)));
                }
            }
        }
    }
    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
        Err(e) => {
            if outcome.is_ok() {
                outcome = Err(EngineError::Io(std::io::Error::other(e)));
            }
        }
    }

    renderer.finish(&book);

    if cancel.is_cancelled() {
        // On-disk state is already consistent; reset_dirty on the next run
        // recovers anything left RUNNING.
        return Err(EngineError::Cancelled);
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn upload_one_block(
    catalog: &dyn Catalog,
    backend: &dyn StorageBackend,
    handle: &UploadHandle,
    upload_id: i64,
    block_id: i64,
    worker_id: usize,
    file_path: &std::path::Path,
    book: &Arc<ProgressBook>,
    renderer: &Arc<ProgressRenderer>,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    let block = catalog.get_block(block_id).await?;
    debug!(
        upload_id,
        block_id,
        block_number = block.block_number,
        worker_id,
        "uploading block"
    );

    let bytes = file_io::read_range(file_path, block.file_offset as u64, block.size as usize, cancel)
        .await?;
    if bytes.is_empty() {
        return Err(EngineError::InvalidState(format!(
            "block {} reads empty at offset {}",
            block.block_number, block.file_offset
        )));
    }

    let progress = {
        let book = Arc::clone(book);
        let renderer = Arc::clone(renderer);
        let block_number = block.block_number;
        let block_size = block.size as u64;
        Arc::new(move |sent: u64| {
            book.record(worker_id, block_number, block_size, sent);
            renderer.render(&book, false);
        }) as stowage_backend::ProgressFn
    };

    let receipt = match backend
        .upload_part(handle, block.block_number, bytes.into(), Some(progress))
        .await
    {
        Ok(receipt) => receipt,
        Err(e) => {
            if e.is_retryable() {
                let error_count = catalog
                    .mark_error(upload_id, block_id, &e.to_string())
                    .await?;
                debug!(upload_id, block_id, error_count, "block marked errored");
            }
            return Err(EngineError::Backend(e));
        }
    };

    catalog
        .mark_complete(upload_id, block_id, &receipt.checksum_sha256, &receipt.etag)
        .await?;

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}
