mod logic;
pub(crate) mod archive;
pub(crate) mod cleanup;
pub(crate) mod db_dump;
pub(crate) mod s3_upload;
#[cfg(test)]
pub(crate) mod test_support;

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};

use crate::config::BackupTarget;

pub use archive::ArchiveProducer;
pub use cleanup::RemoveFile;
pub use db_dump::PgDumpCommand;
pub use logic::{BackupOrchestrator, RunReport};
pub use s3_upload::S3Uploader;

/// Pipeline stage a job failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dump,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Dumped,
    Uploaded,
    CleanedUp,
    Failed(Stage),
}

/// One target's backup within a single run. Paths and keys are derived from
/// the capture timestamp, so every run produces a fresh object.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub target: BackupTarget,
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    pub local_path: PathBuf,
    pub remote_key: String,
    pub status: JobStatus,
}

impl BackupJob {
    pub fn new(target: BackupTarget, timestamp: DateTime<Utc>, temp_root: &Path) -> Self {
        let file_name = format!("backup-{}.tar.gz", sanitize_timestamp(&timestamp));
        let local_path = temp_root.join(&target.name).join(&file_name);
        let remote_key = format!("{}/{}", target.name, file_name);
        BackupJob {
            target,
            timestamp,
            file_name,
            local_path,
            remote_key,
            status: JobStatus::Pending,
        }
    }
}

/// ISO-8601 with millisecond precision, with `:` and `.` replaced by `-`.
pub fn sanitize_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}
