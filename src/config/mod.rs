// pgbackup-s3/src/config/mod.rs
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::errors::ConfigError;
use crate::schedule::BackupSchedule;

const DEFAULT_CRON_SCHEDULE: &str = "0 5 * * *";
const DEFAULT_DUMP_TOOL: &str = "pg_dump";
const DEFAULT_DUMP_ARGS: &str = "--format=tar";

/// One database to back up.
#[derive(Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub name: String,
    pub connection_url: String,
}

impl BackupTarget {
    /// Connection URL with any password replaced, safe for logs.
    pub fn redacted_url(&self) -> String {
        redact_url(&self.connection_url)
    }
}

impl fmt::Debug for BackupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupTarget")
            .field("name", &self.name)
            .field("connection_url", &self.redacted_url())
            .finish()
    }
}

/// Where archives are stored. Shared read-only by every upload in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDestination {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

#[derive(Clone)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// How the external dump tool is invoked: `<tool> <connection-url> <args...>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSettings {
    pub tool: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub credentials: StorageCredentials,
    pub destination: StorageDestination,
    pub targets: Vec<BackupTarget>,
    pub schedule: BackupSchedule,
    pub run_on_startup: bool,
    pub temp_root: PathBuf,
    pub dump: DumpSettings,
    pub run_timeout: Option<Duration>,
}

// Shape of one element of BACKUP_DATABASE_URLS_CONFIG before validation.
#[derive(Debug, Deserialize)]
struct RawTarget {
    url: Option<String>,
    name: Option<String>,
}

impl AppConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing { key });

        let credentials = StorageCredentials {
            access_key_id: required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
        };

        let endpoint = get("AWS_S3_ENDPOINT");
        if let Some(endpoint) = &endpoint {
            Url::parse(endpoint).map_err(|e| ConfigError::Invalid {
                key: "AWS_S3_ENDPOINT",
                reason: e.to_string(),
            })?;
        }

        let destination = StorageDestination {
            bucket: required("AWS_S3_BUCKET")?,
            region: required("AWS_S3_REGION")?,
            endpoint,
            force_path_style: parse_bool(
                "AWS_S3_FORCE_PATH_STYLE",
                get("AWS_S3_FORCE_PATH_STYLE"),
                false,
            )?,
        };

        let targets = parse_targets(&required("BACKUP_DATABASE_URLS_CONFIG")?)?;

        let cron = get("BACKUP_CRON_SCHEDULE").unwrap_or_else(|| DEFAULT_CRON_SCHEDULE.to_string());
        let schedule = BackupSchedule::parse(&cron).map_err(|reason| ConfigError::Invalid {
            key: "BACKUP_CRON_SCHEDULE",
            reason,
        })?;

        let run_on_startup = parse_bool("RUN_ON_STARTUP", get("RUN_ON_STARTUP"), false)?;

        let temp_root = get("BACKUP_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let dump = DumpSettings {
            tool: get("BACKUP_DUMP_TOOL").unwrap_or_else(|| DEFAULT_DUMP_TOOL.to_string()),
            args: get("BACKUP_DUMP_ARGS")
                .unwrap_or_else(|| DEFAULT_DUMP_ARGS.to_string())
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        };

        let run_timeout = match get("BACKUP_RUN_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: "BACKUP_RUN_TIMEOUT_SECS",
                    reason: format!("expected a whole number of seconds, got {:?}", raw),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        key: "BACKUP_RUN_TIMEOUT_SECS",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(AppConfig {
            credentials,
            destination,
            targets,
            schedule,
            run_on_startup,
            temp_root,
            dump,
            run_timeout,
        })
    }
}

/// Parses the JSON array of `{ "url", "name" }` objects. Any bad element rejects the whole list.
fn parse_targets(raw: &str) -> Result<Vec<BackupTarget>, ConfigError> {
    const KEY: &str = "BACKUP_DATABASE_URLS_CONFIG";
    let invalid = |reason: String| ConfigError::Invalid { key: KEY, reason };

    let parsed: Vec<RawTarget> = serde_json::from_str(raw).map_err(|e| {
        invalid(format!(
            "expected a JSON array of objects containing a url and a name ({})",
            e
        ))
    })?;

    if parsed.is_empty() {
        return Err(invalid("at least one backup target is required".to_string()));
    }

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(parsed.len());
    for (index, item) in parsed.into_iter().enumerate() {
        let url = item
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| invalid(format!("missing url property at index {}", index)))?;
        let name = item
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| invalid(format!("missing name property at index {}", index)))?;

        if !is_safe_path_segment(&name) {
            return Err(invalid(format!(
                "name {:?} at index {} must be a single path segment without separators",
                name, index
            )));
        }
        if !seen.insert(name.clone()) {
            return Err(invalid(format!("duplicate name {:?} at index {}", name, index)));
        }

        targets.push(BackupTarget {
            name,
            connection_url: url,
        });
    }
    Ok(targets)
}

fn is_safe_path_segment(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

fn parse_bool(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key,
            reason: format!("expected a boolean, got {:?}", other),
        }),
    }
}

/// Replaces the password in a URL. Unparseable input is hidden entirely.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
