//! Scheduled PostgreSQL backups to S3-compatible object storage.
//!
//! Each configured database is dumped through gzip into a local temp file,
//! uploaded under `{name}/backup-{timestamp}.tar.gz`, and removed locally.

// pgbackup-s3/src/main.rs
mod backup;
mod config;
mod errors;
mod schedule;

use anyhow::{Context, Result};
use backup::{ArchiveProducer, BackupOrchestrator, PgDumpCommand, RemoveFile, S3Uploader};
use bytesize::ByteSize;
use clap::Parser;
use config::AppConfig;
use schedule::{BackupRunner, run_scheduled, shutdown_signal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pgbackup-s3", version, about = "Back up PostgreSQL databases to S3 on a schedule")]
struct Cli {
    /// Run a single backup of every target and exit instead of scheduling.
    #[arg(long)]
    once: bool,

    /// Load environment variables from this file instead of `./.env`.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    // Loaded before logging so RUST_LOG may come from the env file.
    let env_file = load_env_file(cli.env_file.as_deref());
    init_tracing();

    match run_app(cli, env_file).await {
        Ok(_) => {
            info!("Operation completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => {
            dotenv::from_path(path)
                .with_context(|| format!("Failed to load env file {}", path.display()))?;
            Ok(Some(path.to_path_buf()))
        }
        None => Ok(dotenv::dotenv().ok()),
    }
}

async fn run_app(cli: Cli, env_file: Result<Option<PathBuf>>) -> Result<()> {
    if let Some(path) = env_file? {
        info!(path = %path.display(), "Loaded environment file");
    }

    let config = AppConfig::from_env().context("Failed to load configuration from environment")?;
    info!(
        targets = config.targets.len(),
        bucket = %config.destination.bucket,
        region = %config.destination.region,
        schedule = config.schedule.expression(),
        run_on_startup = config.run_on_startup,
        "Configuration loaded"
    );

    let dumper = PgDumpCommand::new(&config.dump);
    match dumper.find_executable() {
        Ok(path) => info!(path = %path.display(), "Found dump tool"),
        Err(e) => warn!(error = %e, "Dump tool is not available; backups will fail until it is installed"),
    }

    let runner = BackupRunner {
        orchestrator: BackupOrchestrator::new(
            ArchiveProducer::new(Arc::new(dumper)),
            Arc::new(S3Uploader::new(config.credentials.clone())),
            Arc::new(RemoveFile),
            config.temp_root.clone(),
        ),
        targets: Arc::new(config.targets.clone()),
        destination: Arc::new(config.destination.clone()),
        run_timeout: config.run_timeout,
    };

    if cli.once {
        let report = runner.run_once().await.context("Backup process failed")?;
        for outcome in &report.outcomes {
            info!(
                target = %outcome.target,
                key = %outcome.remote_key,
                size = %outcome.archive.as_ref().map(|a| ByteSize::b(a.size_bytes).to_string()).unwrap_or_default(),
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                dump_warnings = outcome.archive.as_ref().is_some_and(|a| a.warnings.is_some()),
                cleanup_warning = outcome.cleanup_warning.is_some(),
                "Backup stored"
            );
        }
        return Ok(());
    }

    run_scheduled(runner, config.schedule.clone(), config.run_on_startup, shutdown_signal()).await
}
