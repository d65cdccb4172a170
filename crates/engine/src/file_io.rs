//! Cancellable positional file reads.

use crate::error::{EngineError, EngineResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Size and modification time of a regular file.
#[derive(Clone, Copy, Debug)]
pub struct FileInfo {
    pub size: u64,
    pub modified_at: OffsetDateTime,
}

/// Stat a regular file. Directories are rejected.
pub fn file_info(path: &Path) -> EngineResult<FileInfo> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_dir() {
        return Err(EngineError::InvalidState(format!(
            "{} is a directory",
            path.display()
        )));
    }
    Ok(FileInfo {
        size: metadata.len(),
        modified_at: metadata.modified().map(OffsetDateTime::from)?,
    })
}

/// Read up to `len` bytes at `offset`, short at EOF.
///
/// The positional read runs on a blocking helper; if `cancel` fires before
/// the I/O returns, the read is abandoned and `Cancelled` comes back.
pub async fn read_range(
    path: &Path,
    offset: u64,
    len: usize,
    cancel: &CancellationToken,
) -> EngineResult<Vec<u8>> {
    let path: PathBuf = path.to_path_buf();
    let handle = tokio::task::spawn_blocking(move || read_range_blocking(&path, offset, len));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = handle => match result {
            Ok(inner) => inner,
            Err(e) => Err(EngineError::Io(std::io::Error::other(e))),
        },
    }
}

fn read_range_blocking(path: &Path, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
