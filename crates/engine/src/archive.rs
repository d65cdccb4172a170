//! Archive collaborator: walks an input tree and produces the `.tar.gz`
//! file the upload engine transports.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use stowage_catalog::models::NewFileCatalogEntry;
use stowage_core::checksum::Sha256Writer;
use stowage_core::checksum;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

/// Aggregate facts about the walked input tree.
#[derive(Clone, Debug, Default)]
pub struct FilesInfo {
    pub total_file_count: u64,
    pub readable_file_count: u64,
    pub size_in_bytes: u64,
    /// Hex SHA-256 over `path + size` of every visited entry. Two walks of
    /// unchanged content produce the same fingerprint.
    pub content_hash: String,
}

/// Result of planning an archive run.
#[derive(Clone, Debug)]
pub struct ArchivePlan {
    pub info: FilesInfo,
    pub entries: Vec<NewFileCatalogEntry>,
}

/// The archiver contract the orchestrator consumes.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Walk the input tree: fingerprint, sizes, file catalogue entries.
    async fn plan(&self, cancel: CancellationToken) -> EngineResult<ArchivePlan>;

    /// Produce the archive file at [`Archiver::archive_path`].
    async fn start(&self, cancel: CancellationToken) -> EngineResult<()>;

    /// Whether an archive already exists at the output path and parses.
    async fn is_valid(&self) -> bool;

    /// Where the archive lands.
    fn archive_path(&self) -> &Path;
}

/// `.tar.gz` archiver over a directory tree.
pub struct TarGzArchiver {
    input_path: PathBuf,
    output_path: PathBuf,
}

impl TarGzArchiver {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
        }
    }
}

#[async_trait]
impl Archiver for TarGzArchiver {
    async fn plan(&self, cancel: CancellationToken) -> EngineResult<ArchivePlan> {
        let input = self.input_path.clone();
        run_blocking(move || plan_blocking(&input, &cancel)).await
    }

    async fn start(&self, cancel: CancellationToken) -> EngineResult<()> {
        let input = self.input_path.clone();
        let output = self.output_path.clone();
        run_blocking(move || start_blocking(&input, &output, &cancel)).await
    }

    async fn is_valid(&self) -> bool {
        let output = self.output_path.clone();
        tokio::task::spawn_blocking(move || is_valid_tar_gz(&output))
            .await
            .unwrap_or(false)
    }

    fn archive_path(&self) -> &Path {
        &self.output_path
    }
}

async fn run_blocking<T, F>(f: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(EngineError::Io(std::io::Error::other(e))),
    }
}

/// Paths that hang or explode when walked; never archived.
fn is_special_path(path: &Path) -> bool {
    ["/proc", "/dev", "/sys"]
        .iter()
        .any(|p| path.starts_with(p))
}

fn is_readable(path: &Path) -> bool {
    File::open(path).is_ok()
}

fn plan_blocking(input: &Path, cancel: &CancellationToken) -> EngineResult<ArchivePlan> {
    let mut info = FilesInfo::default();
    let mut entries = Vec::new();
    let mut hasher = Sha256Writer::new();

    let mut walker = WalkDir::new(input).into_iter();
    while let Some(next) = walker.next() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unwalkable entry");
                continue;
            }
        };
        let path = entry.path();
        if is_special_path(path) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };

        if entry.file_type().is_file() {
            info.total_file_count += 1;
            if is_readable(path) {
                info.readable_file_count += 1;
                info.size_in_bytes += metadata.len();
            } else {
                debug!(path = %path.display(), "unreadable file excluded from archive");
            }
        }

        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(metadata.len().to_string().as_bytes());

        entries.push(NewFileCatalogEntry {
            full_path: path.display().to_string(),
            name: entry.file_name().to_string_lossy().into_owned(),
            parent_path: path.parent().map(|p| p.display().to_string()),
            file_type: if entry.file_type().is_dir() { "dir" } else { "file" }.to_string(),
            size_bytes: metadata.len() as i64,
            modified_at: metadata.modified().ok().map(OffsetDateTime::from),
        });
    }

    info.content_hash = checksum::hex_encode(&hasher.finish());
    Ok(ArchivePlan { info, entries })
}

fn start_blocking(input: &Path, output: &Path, cancel: &CancellationToken) -> EngineResult<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let root_name = input
        .file_name()
        .map(|n| PathBuf::from(n))
        .unwrap_or_else(|| PathBuf::from("archive"));

    let file = File::create(output)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut walker = WalkDir::new(input).into_iter();
    while let Some(next) = walker.next() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let entry = match next {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        if is_special_path(path) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        let relative = match path.strip_prefix(input) {
            Ok(rel) => root_name.join(rel),
            Err(_) => continue,
        };

        let result = if entry.file_type().is_dir() {
            builder.append_dir(&relative, path)
        } else if entry.file_type().is_file() {
            builder.append_path_with_name(path, &relative)
        } else {
            continue;
        };
        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "entry skipped during archiving");
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| EngineError::Archive(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| EngineError::Archive(e.to_string()))?;
    Ok(())
}

/// Gzip magic plus a parseable first tar header.
fn is_valid_tar_gz(path: &Path) -> bool {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_err() || magic != [0x1f, 0x8b] {
        return false;
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    match archive.entries() {
        Ok(mut entries) => match entries.next() {
            Some(Ok(_)) | None => true,
            Some(Err(_)) => false,
        },
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        let mut a = File::create(dir.join("a.txt")).unwrap();
        a.write_all(b"alpha contents").unwrap();
        let mut b = File::create(dir.join("sub/b.txt")).unwrap();
        b.write_all(b"beta").unwrap();
    }

    #[tokio::test]
    async fn plan_counts_files_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());

        let archiver = TarGzArchiver::new(dir.path(), dir.path().join("out.tar.gz"));
        let plan = archiver.plan(CancellationToken::new()).await.unwrap();

        assert_eq!(plan.info.total_file_count, 2);
        assert_eq!(plan.info.readable_file_count, 2);
        assert_eq!(plan.info.size_in_bytes, 14 + 4);
        assert_eq!(plan.info.content_hash.len(), 64);
        assert!(plan.entries.iter().any(|e| e.file_type == "dir"));
        assert!(plan.entries.iter().any(|e| e.name == "b.txt"));
    }

    #[tokio::test]
    async fn fingerprint_is_stable_until_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let archiver = TarGzArchiver::new(dir.path(), dir.path().join("out.tar.gz"));

        let first = archiver.plan(CancellationToken::new()).await.unwrap();
        let second = archiver.plan(CancellationToken::new()).await.unwrap();
        assert_eq!(first.info.content_hash, second.info.content_hash);

        let mut f = File::create(dir.path().join("a.txt")).unwrap();
        f.write_all(b"alpha contents grew longer").unwrap();
        let third = archiver.plan(CancellationToken::new()).await.unwrap();
        assert_ne!(first.info.content_hash, third.info.content_hash);
    }

    #[tokio::test]
    async fn produces_a_valid_archive_with_contents() {
        let input = tempfile::tempdir().unwrap();
        build_tree(input.path());
        let out_dir = tempfile::tempdir().unwrap();
        let out_path = out_dir.path().join("tree.tar.gz");

        let archiver = TarGzArchiver::new(input.path(), &out_path);
        assert!(!archiver.is_valid().await);

        archiver.start(CancellationToken::new()).await.unwrap();
        assert!(archiver.is_valid().await);

        // Unpack and verify one file's content round-trips.
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&out_path).unwrap()));
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy().ends_with("a.txt") {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                assert_eq!(content, "alpha contents");
                found = true;
            }
        }
        assert!(found);
    }

    #[tokio::test]
    async fn garbage_file_is_not_a_valid_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();
        let archiver = TarGzArchiver::new(dir.path(), &path);
        assert!(!archiver.is_valid().await);
    }

    #[tokio::test]
    async fn cancelled_plan_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let archiver = TarGzArchiver::new(dir.path(), dir.path().join("out.tar.gz"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = archiver.plan(cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
