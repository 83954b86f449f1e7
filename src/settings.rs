//! Runner settings read from the process environment
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `DATABASE_URL` | experiment database | required |
//! | `FEDLAB_PROJECT_ROOT` | uploads, module cache, checkpoints | current directory |
//! | `FEDLAB_LOG` | `tracing` filter directive | `info` |
//! | `FEDLAB_ECHO_LOGS` | also mirror the run log to stderr | off |
//! | `FEDLAB_WORKERS` | client worker threads | derived from CPU count |

use std::path::PathBuf;

use crate::{Error, Result};

/// Environment variable holding the database location.
pub const DATABASE_URL: &str = "DATABASE_URL";

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Normalized database location (a SQLite file path).
    pub database_url: String,
    /// Root that relative upload and checkpoint paths resolve against.
    pub project_root: PathBuf,
    /// Filter directive for run logging.
    pub log_filter: String,
    /// Mirror captured run logs to stderr.
    pub echo_logs: bool,
    /// Pinned worker count; `None` sizes the pool from the CPU count.
    pub workers: Option<usize>,
}

impl RunnerSettings {
    /// Settings with defaults for everything but the database.
    #[must_use]
    pub fn new(database_url: impl AsRef<str>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            database_url: normalize_database_url(database_url.as_ref()),
            project_root: project_root.into(),
            log_filter: "info".to_string(),
            echo_logs: false,
            workers: None,
        }
    }

    /// Read settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `DATABASE_URL` is unset or empty, or a
    /// numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup (used by tests).
    ///
    /// # Errors
    ///
    /// Same as [`RunnerSettings::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(DATABASE_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!("{DATABASE_URL} environment variable not set"))
            })?;

        let project_root = match lookup("FEDLAB_PROJECT_ROOT") {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => std::env::current_dir()?,
        };

        let mut settings = Self::new(database_url, project_root);
        if let Some(filter) = lookup("FEDLAB_LOG").filter(|v| !v.is_empty()) {
            settings.log_filter = filter;
        }
        settings.echo_logs = lookup("FEDLAB_ECHO_LOGS")
            .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
        settings.workers = lookup("FEDLAB_WORKERS")
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| Error::Config(format!("FEDLAB_WORKERS must be a number, got '{v}'")))
            })
            .transpose()?
            .filter(|&n| n > 0);
        Ok(settings)
    }
}

/// Strip ORM query fragments and URL schemes so the value is a SQLite path.
///
/// ```
/// use fedlab::settings::normalize_database_url;
///
/// assert_eq!(normalize_database_url("sqlite:///tmp/fl.db?schema=public"), "/tmp/fl.db");
/// assert_eq!(normalize_database_url("file:dev.db"), "file:dev.db");
/// ```
#[must_use]
pub fn normalize_database_url(url: &str) -> String {
    let mut url = url.trim();
    for marker in ["?schema=", "&schema="] {
        if let Some(idx) = url.find(marker) {
            url = &url[..idx];
        }
    }
    if let Some(rest) = url.strip_prefix("sqlite://") {
        rest.to_string()
    } else if let Some(rest) = url.strip_prefix("sqlite:") {
        rest.to_string()
    } else {
        url.to_string()
    }
}
