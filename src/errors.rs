use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Rejected or missing settings. Raised before any backup job starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failures while producing the local archive for one target.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("dump tool failed ({status}): {stderr}")]
    ToolFailure { status: String, stderr: String },

    #[error("backup archive is invalid or empty: {reason}")]
    InvalidArchive { reason: String },

    #[error("failed to stream dump output into the archive: {0}")]
    Stream(#[source] std::io::Error),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dump cancelled before it finished")]
    Cancelled,
}

/// Failures while sending an archive to object storage.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to read {} for upload: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage service rejected {operation} for s3://{bucket}/{key}: {message}")]
    Service {
        operation: &'static str,
        bucket: String,
        key: String,
        message: String,
    },

    #[error("storage service returned no upload id for s3://{bucket}/{key}")]
    MissingUploadId { bucket: String, key: String },

    #[error("upload of {key} cancelled before it finished")]
    Cancelled { key: String },
}

#[derive(Error, Debug)]
#[error("failed to remove local file {}: {source}", .path.display())]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// The reason a single target's pipeline failed.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("dump failed: {0}")]
    Dump(#[from] DumpError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("backup task panicked: {0}")]
    Panicked(String),
}

/// A failed target together with any local file it leaked on the way out.
#[derive(Debug)]
pub struct TargetFailure {
    pub target: String,
    pub cause: JobError,
    pub leaked: Option<CleanupError>,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.cause)?;
        if let Some(leak) = &self.leaked {
            write!(f, " (also {})", leak)?;
        }
        Ok(())
    }
}

/// Returned by a run in which one or more targets failed.
#[derive(Debug)]
pub struct AggregateError {
    pub attempted: usize,
    pub failures: Vec<TargetFailure>,
}

impl AggregateError {
    pub fn failed_targets(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} backup target(s) failed",
            self.failures.len(),
            self.attempted
        )?;
        for failure in &self.failures {
            write!(f, "\n  - {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
