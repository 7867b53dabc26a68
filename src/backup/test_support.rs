//! Fakes for the dump and storage seams.

use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backup::cleanup::{LocalCleanup, cleanup};
use crate::backup::db_dump::{DumpCapability, DumpReport};
use crate::backup::s3_upload::ObjectStore;
use crate::config::{BackupTarget, StorageDestination};
use crate::errors::{CleanupError, DumpError, UploadError};

pub fn target(name: &str) -> BackupTarget {
    BackupTarget {
        name: name.to_string(),
        connection_url: format!("postgres://backup:pw@db.internal/{}", name),
    }
}

pub fn destination() -> StorageDestination {
    StorageDestination {
        bucket: "backups".to_string(),
        region: "eu-west-1".to_string(),
        endpoint: None,
        force_path_style: false,
    }
}

enum DumpBehavior {
    Bytes { data: Vec<u8>, warning: Option<String> },
    Fail { stderr: String },
}

pub struct FakeDump {
    behavior: DumpBehavior,
}

impl FakeDump {
    pub fn bytes(data: Vec<u8>) -> Self {
        FakeDump {
            behavior: DumpBehavior::Bytes { data, warning: None },
        }
    }

    pub fn fail(stderr: &str) -> Self {
        FakeDump {
            behavior: DumpBehavior::Fail {
                stderr: stderr.to_string(),
            },
        }
    }

    pub fn with_warning(mut self, text: &str) -> Self {
        if let DumpBehavior::Bytes { warning, .. } = &mut self.behavior {
            *warning = Some(text.to_string());
        }
        self
    }
}

impl DumpCapability for FakeDump {
    fn stream(
        &self,
        _connection_url: &str,
        sink: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<DumpReport, DumpError> {
        if cancel.is_cancelled() {
            return Err(DumpError::Cancelled);
        }
        match &self.behavior {
            DumpBehavior::Bytes { data, warning } => {
                sink.write_all(data).map_err(DumpError::Stream)?;
                Ok(DumpReport {
                    bytes_written: data.len() as u64,
                    warnings: warning.clone(),
                })
            }
            DumpBehavior::Fail { stderr } => Err(DumpError::ToolFailure {
                status: "exit status: 1".to_string(),
                stderr: stderr.clone(),
            }),
        }
    }
}

/// Dispatches to a per-target behaviour, keyed by the database name at the
/// end of the connection URL built by [`target`].
pub struct PerTargetDump {
    pub routes: Vec<(String, FakeDump)>,
}

impl DumpCapability for PerTargetDump {
    fn stream(
        &self,
        connection_url: &str,
        sink: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<DumpReport, DumpError> {
        let (_, dump) = self
            .routes
            .iter()
            .find(|(name, _)| connection_url.ends_with(&format!("/{}", name)))
            .ok_or_else(|| DumpError::ToolFailure {
                status: "exit status: 2".to_string(),
                stderr: format!("no fake route for {}", connection_url),
            })?;
        dump.stream(connection_url, sink, cancel)
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub contents: Vec<u8>,
}

/// Records every upload. Keys under a failing prefix are rejected; keys under
/// a sabotaged prefix have their local file swapped for a directory so the
/// following cleanup fails.
#[derive(Default)]
pub struct RecordingStore {
    pub failing: HashSet<String>,
    pub sabotaged: HashSet<String>,
    pub calls: Mutex<Vec<String>>,
    pub stored: Mutex<Vec<StoredObject>>,
}

impl RecordingStore {
    pub fn failing(names: &[&str]) -> Self {
        RecordingStore {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stored(&self) -> Vec<StoredObject> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        destination: &StorageDestination,
    ) -> Result<(), UploadError> {
        self.calls.lock().unwrap().push(key.to_string());
        let prefix = key.split('/').next().unwrap_or_default();

        let outcome = if self.failing.contains(prefix) {
            Err(UploadError::Service {
                operation: "PutObject",
                bucket: destination.bucket.clone(),
                key: key.to_string(),
                message: "AccessDenied".to_string(),
            })
        } else {
            let contents = std::fs::read(local_path).map_err(|e| UploadError::Read {
                path: local_path.to_path_buf(),
                source: e,
            })?;
            self.stored.lock().unwrap().push(StoredObject {
                bucket: destination.bucket.clone(),
                key: key.to_string(),
                contents,
            });
            Ok(())
        };

        if self.sabotaged.contains(prefix) {
            std::fs::remove_file(local_path).unwrap();
            std::fs::create_dir(local_path).unwrap();
            std::fs::write(local_path.join("pinned"), b"x").unwrap();
        }
        outcome
    }
}

/// Takes `delay` per upload and counts the uploads that ran to completion.
pub struct SlowStore {
    pub delay: Duration,
    pub completed: AtomicUsize,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        SlowStore {
            delay,
            completed: AtomicUsize::new(0),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for SlowStore {
    async fn upload(
        &self,
        _local_path: &Path,
        _key: &str,
        _destination: &StorageDestination,
    ) -> Result<(), UploadError> {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Deletes for real and remembers every path it was asked to remove.
#[derive(Default)]
pub struct CountingCleanup {
    pub removed: Mutex<Vec<PathBuf>>,
}

impl CountingCleanup {
    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalCleanup for CountingCleanup {
    async fn remove(&self, local_path: &Path) -> Result<(), CleanupError> {
        self.removed.lock().unwrap().push(local_path.to_path_buf());
        cleanup(local_path).await
    }
}
