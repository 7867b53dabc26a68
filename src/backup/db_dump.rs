// pgbackup-s3/src/backup/db_dump.rs
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use which::which;

use crate::config::{DumpSettings, redact_url};
use crate::errors::DumpError;

/// What a successful dump reported besides its output bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpReport {
    pub bytes_written: u64,
    /// Text the tool wrote to stderr while still exiting successfully.
    pub warnings: Option<String>,
}

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Streams the logical contents of a database into a writer.
///
/// Implementations block; callers run them on a blocking thread. Once
/// `cancel` fires the dump stops as soon as it can and returns
/// [`DumpError::Cancelled`].
pub trait DumpCapability: Send + Sync {
    fn stream(
        &self,
        connection_url: &str,
        sink: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<DumpReport, DumpError>;
}

/// Runs an external dump tool (`pg_dump` by default) as
/// `<tool> <connection-url> <args...>` and pipes its stdout into the sink.
#[derive(Debug, Clone)]
pub struct PgDumpCommand {
    tool: String,
    args: Vec<String>,
}

impl PgDumpCommand {
    pub fn new(settings: &DumpSettings) -> Self {
        PgDumpCommand {
            tool: settings.tool.clone(),
            args: settings.args.clone(),
        }
    }

    /// Locates the configured tool on PATH.
    pub fn find_executable(&self) -> Result<PathBuf, DumpError> {
        which(&self.tool).map_err(|e| DumpError::ToolFailure {
            status: "not started".to_string(),
            stderr: format!(
                "{} executable not found in PATH ({}). Please ensure PostgreSQL client tools are installed and in your PATH.",
                self.tool, e
            ),
        })
    }
}

impl DumpCapability for PgDumpCommand {
    fn stream(
        &self,
        connection_url: &str,
        sink: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<DumpReport, DumpError> {
        if cancel.is_cancelled() {
            return Err(DumpError::Cancelled);
        }
        let program = self.find_executable()?;
        debug!(
            tool = %program.display(),
            url = %redact_url(connection_url),
            args = ?self.args,
            "Spawning dump tool"
        );

        let mut child = Command::new(&program)
            .arg(connection_url)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DumpError::ToolFailure {
                status: "not started".to_string(),
                stderr: format!("failed to execute {}: {}", program.display(), e),
            })?;

        // Drain stderr on its own thread so a chatty tool cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut buf) {
                    debug!(error = %e, "Failed to read dump tool stderr");
                }
                String::from_utf8_lossy(&buf).trim_end().to_string()
            })
        });
        let stdout = child.stdout.take();

        let child = Arc::new(Mutex::new(child));
        let finished = Arc::new(AtomicBool::new(false));
        let watcher = {
            let child = Arc::clone(&child);
            let finished = Arc::clone(&finished);
            let cancel = cancel.clone();
            thread::spawn(move || {
                while !finished.load(Ordering::Acquire) {
                    if cancel.is_cancelled() {
                        kill_child(&child);
                        return;
                    }
                    thread::sleep(CANCEL_POLL_INTERVAL);
                }
            })
        };

        let copied = match stdout {
            Some(mut stdout) => io::copy(&mut stdout, sink),
            None => Err(io::Error::other("dump tool stdout was not captured")),
        };
        if copied.is_err() {
            kill_child(&child);
        }
        finished.store(true, Ordering::Release);
        if watcher.join().is_err() {
            debug!("Dump cancellation watcher panicked");
        }

        let status = child
            .lock()
            .map_err(|_| DumpError::ToolFailure {
                status: "unknown".to_string(),
                stderr: format!("lost track of {} process", program.display()),
            })?
            .wait()
            .map_err(|e| DumpError::ToolFailure {
                status: "unknown".to_string(),
                stderr: format!("failed to wait for {}: {}", program.display(), e),
            })?;
        let stderr = match stderr_reader.map(|handle| handle.join()) {
            Some(Ok(stderr)) => stderr,
            Some(Err(_)) => {
                debug!("Dump tool stderr reader panicked; stderr is lost");
                String::new()
            }
            None => String::new(),
        };

        if cancel.is_cancelled() {
            debug!(status = %status, "Dump tool stopped after cancellation");
            return Err(DumpError::Cancelled);
        }

        let bytes_written = copied.map_err(DumpError::Stream)?;

        if !status.success() {
            return Err(DumpError::ToolFailure {
                status: status.to_string(),
                stderr,
            });
        }

        Ok(DumpReport {
            bytes_written,
            warnings: (!stderr.is_empty()).then_some(stderr),
        })
    }
}

fn kill_child(child: &Mutex<Child>) {
    match child.lock() {
        Ok(mut child) => {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Failed to kill dump tool");
            }
        }
        Err(_) => debug!("Dump tool handle poisoned; cannot kill it"),
    }
}
