// pgbackup-s3/src/backup/archive.rs
use bytesize::ByteSize;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::db_dump::{DumpCapability, DumpReport};
use crate::config::BackupTarget;
use crate::errors::DumpError;

/// The compressed archive left on local storage by a successful dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub warnings: Option<String>,
}

/// Produces one gzip-compressed archive per target from a dump capability.
#[derive(Clone)]
pub struct ArchiveProducer {
    dumper: Arc<dyn DumpCapability>,
}

impl ArchiveProducer {
    pub fn new(dumper: Arc<dyn DumpCapability>) -> Self {
        ArchiveProducer { dumper }
    }

    /// Dumps `target` straight through a gzip encoder into `dest_path` and
    /// checks the result decompresses to at least one byte.
    ///
    /// On failure or cancellation the (possibly partial) file is left in place
    /// for cleanup.
    pub async fn produce(
        &self,
        target: &BackupTarget,
        dest_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ArchiveInfo, DumpError> {
        info!(target = %target.name, path = %dest_path.display(), "Dumping DB to file");

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| DumpError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let dumper = Arc::clone(&self.dumper);
        let url = target.connection_url.clone();
        let path = dest_path.to_path_buf();
        let cancel = cancel.clone();
        let (report, size_bytes) = tokio::task::spawn_blocking(move || {
            let report = write_compressed(dumper.as_ref(), &url, &path, &cancel)?;
            let size = verify_archive(&path)?;
            Ok::<_, DumpError>((report, size))
        })
        .await
        .map_err(|e| DumpError::Io {
            path: dest_path.to_path_buf(),
            source: std::io::Error::other(format!("dump task did not complete: {}", e)),
        })??;

        // Not every line on stderr is fatal; pg_dump also reports warnings there.
        if let Some(warnings) = &report.warnings {
            warn!(target = %target.name, stderr = %warnings, "Dump tool wrote to stderr");
            warn!(
                target = %target.name,
                "Potential warnings detected; please ensure the backup file {:?} contains all needed data",
                dest_path.file_name().unwrap_or_default()
            );
        }

        info!(
            target = %target.name,
            dumped_bytes = report.bytes_written,
            size = %ByteSize::b(size_bytes),
            "Backup archive file is valid"
        );

        Ok(ArchiveInfo {
            path: dest_path.to_path_buf(),
            size_bytes,
            warnings: report.warnings,
        })
    }
}

/// Streams the dump into a gzip encoder on `path`. Blocking.
fn write_compressed(
    dumper: &dyn DumpCapability,
    url: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<DumpReport, DumpError> {
    let io_err = |source| DumpError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(io_err)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let report = dumper.stream(url, &mut encoder, cancel)?;
    let mut writer = encoder.finish().map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    writer.get_ref().sync_all().map_err(io_err)?;
    Ok(report)
}

/// Checks that the archive at `path` is a non-empty gzip stream that yields
/// at least one byte. Returns the compressed size on success.
pub fn verify_archive(path: &Path) -> Result<u64, DumpError> {
    let size = std::fs::metadata(path)
        .map_err(|e| DumpError::Io {
            path: path.to_path_buf(),
            source: e,
        })?
        .len();
    if size == 0 {
        return Err(DumpError::InvalidArchive {
            reason: format!("{} is empty", path.display()),
        });
    }

    let file = File::open(path).map_err(|e| DumpError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut decoder = GzDecoder::new(file);
    let mut first_byte = [0u8; 1];
    match decoder.read(&mut first_byte) {
        Ok(0) => Err(DumpError::InvalidArchive {
            reason: format!("{} decompresses to zero bytes", path.display()),
        }),
        Ok(_) => Ok(size),
        Err(e) => Err(DumpError::InvalidArchive {
            reason: format!("{} is not a readable gzip stream: {}", path.display(), e),
        }),
    }
}
