//! Triggers for the backup orchestrator: a one-off run, a run at startup,
//! and the recurring cron schedule.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{BackupOrchestrator, RunReport};
use crate::config::{BackupTarget, StorageDestination};

/// A validated cron expression.
///
/// Accepts the common five-field form (`min hour dom month dow`) as well as
/// the six or seven field form with a leading seconds column. Numeric days of
/// the week follow standard cron: 0 and 7 are Sunday, 1 is Monday.
#[derive(Debug, Clone)]
pub struct BackupSchedule {
    expression: String,
    schedule: Schedule,
}

impl BackupSchedule {
    pub fn parse(expression: &str) -> std::result::Result<Self, String> {
        let trimmed = expression.trim();
        let mut fields: Vec<&str> = trimmed.split_whitespace().collect();
        match fields.len() {
            5 => fields.insert(0, "0"),
            6 | 7 => {}
            n => {
                return Err(format!(
                    "expected 5, 6 or 7 space-separated fields, found {} in {:?}",
                    n, trimmed
                ));
            }
        }
        let day_of_week = quartz_day_of_week(fields[5])?;
        let mut normalized: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        normalized[5] = day_of_week;
        let schedule = Schedule::from_str(&normalized.join(" ")).map_err(|e| e.to_string())?;
        Ok(BackupSchedule {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `now`.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(now).next()
    }
}

/// Rewrites a numeric day-of-week field from standard cron numbering
/// (0-7, Sunday is 0 and 7) to the parser's numbering (1-7, Sunday is 1).
/// Named days mean the same in both and pass through untouched.
fn quartz_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }
    let invalid = || format!("invalid day-of-week field {:?}", field);

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().map_err(|_| invalid())?),
            None => (item, 1),
        };
        if step == 0 {
            return Err(invalid());
        }
        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (day_number(start).ok_or_else(invalid)?, day_number(end).ok_or_else(invalid)?),
                None => {
                    let day = day_number(range).ok_or_else(invalid)?;
                    (day, if item.contains('/') { 6 } else { day })
                }
            },
        };
        if start > end {
            return Err(invalid());
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }

    Ok(days
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .map(|(day, _)| (day + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

fn day_number(text: &str) -> Option<usize> {
    text.parse::<usize>().ok().filter(|day| *day <= 7)
}

/// Everything a trigger needs to start a run.
#[derive(Clone)]
pub struct BackupRunner {
    pub orchestrator: BackupOrchestrator,
    pub targets: Arc<Vec<BackupTarget>>,
    pub destination: Arc<StorageDestination>,
    pub run_timeout: Option<Duration>,
}

impl BackupRunner {
    /// Runs one backup across all targets, bounded by the optional run timeout.
    ///
    /// When the timeout fires, every job still dumping or uploading is
    /// cancelled and cleaned up before the run is reported as timed out.
    pub async fn run_once(&self) -> Result<RunReport> {
        info!(targets = self.targets.len(), "Initiating DB backup");
        let cancel = CancellationToken::new();
        let run = self
            .orchestrator
            .run_backup(&self.targets, Arc::clone(&self.destination), cancel.clone());

        let result = match self.run_timeout {
            Some(limit) => {
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = tokio::time::sleep(limit) => {
                        warn!(limit = ?limit, "Backup run timed out, cancelling jobs still in flight");
                        cancel.cancel();
                        if let Err(e) = run.await {
                            error!(
                                attempted = e.attempted,
                                failed = ?e.failed_targets(),
                                "Backup run stopped after timeout"
                            );
                        }
                        anyhow::bail!("Backup run timed out after {:?}", limit);
                    }
                }
            }
            None => run.await,
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(
                    attempted = e.attempted,
                    failed = ?e.failed_targets(),
                    "Backup run finished with failures"
                );
                return Err(e.into());
            }
        };

        info!(targets = report.outcomes.len(), "DB backup complete");
        Ok(report)
    }
}

/// Runs backups on `schedule` until `shutdown` resolves. A failed run is
/// logged and the next scheduled run still happens.
pub async fn run_scheduled<S>(
    runner: BackupRunner,
    schedule: BackupSchedule,
    run_on_startup: bool,
    shutdown: S,
) -> Result<()>
where
    S: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown);

    if run_on_startup {
        info!("Running backup on startup");
        if let Err(e) = runner.run_once().await {
            error!(error = %format!("{:#}", e), "Startup backup failed");
        }
    }

    loop {
        let now = Local::now();
        let next = schedule
            .next_after(&now)
            .with_context(|| format!("Cron schedule {:?} has no upcoming run", schedule.expression()))?;
        let wait = (next.clone() - now).to_std().unwrap_or(Duration::ZERO);
        info!(
            schedule = schedule.expression(),
            next_run = %next.to_rfc3339(),
            "Waiting for next scheduled backup"
        );

        tokio::select! {
            _ = &mut shutdown => {
                warn!("Shutdown requested, stopping backup scheduler");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = runner.run_once().await {
            error!(error = %format!("{:#}", e), "Scheduled backup failed");
        }
    }
}

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Failed to install signal handlers, falling back to ctrl-c");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "Signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(signal = "ctrl-c", "Signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::test_support::{FakeDump, RecordingStore, SlowStore, destination, target};
    use crate::backup::{ArchiveProducer, RemoveFile};
    use chrono::{Datelike, Timelike, Utc, Weekday};

    #[test]
    fn test_five_field_expression_fires_on_the_minute() -> anyhow::Result<()> {
        let schedule = BackupSchedule::parse("0 5 * * *").map_err(anyhow::Error::msg)?;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 4, 59, 30).unwrap();

        let next = schedule.next_after(&now).context("no next run")?;
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap());

        let after = schedule.next_after(&next).context("no run after next")?;
        assert_eq!(after, Utc.with_ymd_and_hms(2024, 3, 2, 5, 0, 0).unwrap());
        Ok(())
    }

    #[test]
    fn test_six_field_expression_keeps_seconds() -> anyhow::Result<()> {
        let schedule = BackupSchedule::parse("30 */10 * * * *").map_err(anyhow::Error::msg)?;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();
        let next = schedule.next_after(&now).context("no next run")?;
        assert_eq!((next.minute(), next.second()), (10, 30));
        Ok(())
    }

    fn runner(store: Arc<dyn crate::backup::s3_upload::ObjectStore>, root: &std::path::Path, run_timeout: Option<Duration>) -> BackupRunner {
        let dump = FakeDump::bytes(b"rows".to_vec());
        BackupRunner {
            orchestrator: BackupOrchestrator::new(
                ArchiveProducer::new(Arc::new(dump)),
                store,
                Arc::new(RemoveFile),
                root.to_path_buf(),
            ),
            targets: Arc::new(vec![target("app")]),
            destination: Arc::new(destination()),
            run_timeout,
        }
    }

    #[tokio::test]
    async fn test_startup_run_happens_before_shutdown() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Arc::new(RecordingStore::default());
        let schedule = BackupSchedule::parse("0 5 * * *").map_err(anyhow::Error::msg)?;

        run_scheduled(runner(store.clone(), tmp.path(), None), schedule, true, async {}).await?;

        assert_eq!(store.calls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_startup_run_when_disabled() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Arc::new(RecordingStore::default());
        let schedule = BackupSchedule::parse("0 5 * * *").map_err(anyhow::Error::msg)?;

        run_scheduled(runner(store.clone(), tmp.path(), None), schedule, false, async {}).await?;

        assert!(store.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_once_surfaces_aggregate_failure() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Arc::new(RecordingStore::failing(&["app"]));

        let err = runner(store, tmp.path(), None).run_once().await.unwrap_err();

        let aggregate = err
            .downcast_ref::<crate::errors::AggregateError>()
            .context("expected an aggregate error")?;
        assert_eq!(aggregate.failed_targets(), vec!["app"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_timeout_stops_jobs_still_in_flight() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
        let slow = runner(store.clone(), tmp.path(), Some(Duration::from_millis(50)));

        let err = slow.run_once().await.unwrap_err();
        assert_eq!(err.to_string(), "Backup run timed out after 50ms");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.completed(), 0, "an upload finished after the run timed out");
        let app_dir = tmp.path().join("app");
        if app_dir.exists() {
            assert_eq!(std::fs::read_dir(&app_dir)?.count(), 0);
        }
        Ok(())
    }

    fn weekday_after(expression: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        let schedule = BackupSchedule::parse(expression).map_err(anyhow::Error::msg)?;
        schedule.next_after(&now).context("no next run")
    }

    #[test]
    fn test_day_of_week_uses_standard_cron_numbering() -> anyhow::Result<()> {
        // 2024-03-01 is a Friday.
        let friday = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2024, 3, 4, 5, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 3, 3, 5, 0, 0).unwrap();

        assert_eq!(weekday_after("0 5 * * 1", friday)?, monday);
        assert_eq!(weekday_after("0 5 * * 0", friday)?, sunday);
        assert_eq!(weekday_after("0 5 * * 7", friday)?, sunday);
        assert_eq!(weekday_after("0 0 5 * * 1", friday)?, monday);
        Ok(())
    }

    #[test]
    fn test_weekday_range_skips_the_weekend() -> anyhow::Result<()> {
        let friday = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        let schedule = BackupSchedule::parse("0 5 * * 1-5").map_err(anyhow::Error::msg)?;

        let runs: Vec<_> = schedule.schedule.after(&friday).take(5).map(|t| t.weekday()).collect();
        assert_eq!(
            runs,
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
        );
        Ok(())
    }

    #[test]
    fn test_day_of_week_lists_steps_and_wrapping_ranges() {
        assert_eq!(quartz_day_of_week("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(quartz_day_of_week("0,6").unwrap(), "1,7");
        assert_eq!(quartz_day_of_week("5-7").unwrap(), "1,6,7");
        assert_eq!(quartz_day_of_week("*/2").unwrap(), "1,3,5,7");
        assert_eq!(quartz_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(quartz_day_of_week("*").unwrap(), "*");
        for bad in ["8", "5-1", "*/0", "1-x"] {
            assert!(quartz_day_of_week(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_invalid_expressions_are_rejected() {
        for expr in ["", "daily", "* * *", "61 * * * *", "0 5 * * 8", "0 5 * * * * * *"] {
            assert!(BackupSchedule::parse(expr).is_err(), "accepted {:?}", expr);
        }
    }
}
