use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::archive::{ArchiveInfo, ArchiveProducer};
use crate::backup::cleanup::LocalCleanup;
use crate::backup::s3_upload::ObjectStore;
use crate::backup::{BackupJob, JobStatus, Stage};
use crate::config::{BackupTarget, StorageDestination};
use crate::errors::{AggregateError, CleanupError, JobError, TargetFailure, UploadError};

/// How one target's pipeline ended.
#[derive(Debug)]
pub struct JobOutcome {
    pub target: String,
    pub remote_key: String,
    pub status: JobStatus,
    pub archive: Option<ArchiveInfo>,
    pub elapsed: Duration,
    pub failure: Option<JobError>,
    /// Cleanup failures are only fatal after an earlier failure; otherwise they land here.
    pub cleanup_warning: Option<CleanupError>,
    /// Cleanup failure that followed a dump or upload failure.
    pub leaked: Option<CleanupError>,
}

/// Outcomes of a run in which every target succeeded, in configuration order.
#[derive(Debug)]
pub struct RunReport {
    pub outcomes: Vec<JobOutcome>,
}

/// Runs dump, upload, and cleanup for every target concurrently.
#[derive(Clone)]
pub struct BackupOrchestrator {
    producer: ArchiveProducer,
    store: Arc<dyn ObjectStore>,
    cleaner: Arc<dyn LocalCleanup>,
    temp_root: PathBuf,
}

impl BackupOrchestrator {
    pub fn new(
        producer: ArchiveProducer,
        store: Arc<dyn ObjectStore>,
        cleaner: Arc<dyn LocalCleanup>,
        temp_root: PathBuf,
    ) -> Self {
        BackupOrchestrator {
            producer,
            store,
            cleaner,
            temp_root,
        }
    }

    /// Backs up every target. A failing target never stops its siblings; all
    /// failures are reported together once every pipeline has finished.
    ///
    /// Cancelling `cancel` stops the dump and upload stages of every job still
    /// in flight. Those jobs still clean up, then fail, before this returns.
    pub async fn run_backup(
        &self,
        targets: &[BackupTarget],
        destination: Arc<StorageDestination>,
        cancel: CancellationToken,
    ) -> Result<RunReport, AggregateError> {
        let handles: Vec<_> = targets
            .iter()
            .cloned()
            .map(|target| {
                let orchestrator = self.clone();
                let destination = Arc::clone(&destination);
                let cancel = cancel.clone();
                let name = target.name.clone();
                let handle =
                    tokio::spawn(async move { orchestrator.run_job(target, &destination, &cancel).await });
                (name, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(mut outcome) => {
                    if let Some(cause) = outcome.failure.take() {
                        failures.push(TargetFailure {
                            target: outcome.target.clone(),
                            cause,
                            leaked: outcome.leaked.take(),
                        });
                    } else {
                        outcomes.push(outcome);
                    }
                }
                Err(join_err) => {
                    error!(target = %name, error = %join_err, "Backup task did not complete");
                    failures.push(TargetFailure {
                        target: name,
                        cause: JobError::Panicked(join_err.to_string()),
                        leaked: None,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(RunReport { outcomes })
        } else {
            Err(AggregateError {
                attempted: targets.len(),
                failures,
            })
        }
    }

    async fn run_job(
        &self,
        target: BackupTarget,
        destination: &StorageDestination,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let mut job = BackupJob::new(target, Utc::now(), &self.temp_root);
        let started = Instant::now();
        info!(
            target = %job.target.name,
            url = %job.target.redacted_url(),
            file = %job.file_name,
            captured_at = %job.timestamp.to_rfc3339(),
            key = %job.remote_key,
            "Backing up database"
        );

        let mut archive = None;
        let stage_start = Instant::now();
        let failure = match self.producer.produce(&job.target, &job.local_path, cancel).await {
            Ok(info) => {
                job.status = JobStatus::Dumped;
                info!(
                    target = %job.target.name,
                    elapsed_ms = stage_start.elapsed().as_millis() as u64,
                    "DB dumped to file"
                );
                archive = Some(info);

                let stage_start = Instant::now();
                let uploaded = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(UploadError::Cancelled {
                        key: job.remote_key.clone(),
                    }),
                    result = self.store.upload(&job.local_path, &job.remote_key, destination) => result,
                };
                match uploaded {
                    Ok(()) => {
                        job.status = JobStatus::Uploaded;
                        info!(
                            target = %job.target.name,
                            key = %job.remote_key,
                            elapsed_ms = stage_start.elapsed().as_millis() as u64,
                            "Backup uploaded"
                        );
                        None
                    }
                    Err(e) => {
                        job.status = JobStatus::Failed(Stage::Upload);
                        error!(target = %job.target.name, error = %e, "Upload failed");
                        Some(JobError::Upload(e))
                    }
                }
            }
            Err(e) => {
                job.status = JobStatus::Failed(Stage::Dump);
                error!(target = %job.target.name, error = %e, "Dump failed, skipping upload");
                Some(JobError::Dump(e))
            }
        };

        let mut cleanup_warning = None;
        let mut leaked = None;
        match self.cleaner.remove(&job.local_path).await {
            Ok(()) => {
                if failure.is_none() {
                    job.status = JobStatus::CleanedUp;
                }
            }
            Err(e) if failure.is_none() => {
                warn!(target = %job.target.name, error = %e, "Backup succeeded but the local file could not be removed");
                cleanup_warning = Some(e);
            }
            Err(e) => {
                error!(target = %job.target.name, error = %e, "Local file leaked after failed backup");
                leaked = Some(e);
            }
        }

        let elapsed = started.elapsed();
        if failure.is_none() {
            info!(
                target = %job.target.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Backup complete"
            );
        }

        JobOutcome {
            target: job.target.name,
            remote_key: job.remote_key,
            status: job.status,
            archive,
            elapsed,
            failure,
            cleanup_warning,
            leaked,
        }
    }
}
