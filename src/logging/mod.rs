//! Logging setup
//!
//! Structured `tracing` output to stderr, plus a daily-rolling log file in
//! debug mode or a fixed file when `[logging] file` is set. `RUST_LOG`
//! overrides the configured level.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "chipgate.log";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Write a rolling log file in addition to stderr
    pub debug_mode: bool,
    pub log_dir: Option<PathBuf>,
    /// Fixed log file; takes precedence over the rolling file
    pub file: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            debug_mode: false,
            log_dir: None,
            file: None,
            json: false,
        }
    }

    /// Start from the `[logging]` section of the config file
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        Self {
            level: settings.level.clone(),
            file: settings.file.clone(),
            json: settings.json,
            ..Self::new()
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn with_file(mut self, file: PathBuf) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Filter directive: `debug` in debug mode, otherwise the configured level
    fn filter_directive(&self) -> String {
        if self.debug_mode {
            "chipgate=debug,tower_http=debug,info".to_string()
        } else {
            format!("chipgate={},tower_http=warn,warn", self.level)
        }
    }
}

/// Directory for rolled log files: `$CHIPGATE_LOG_DIR` or `~/.chipgate/logs`.
pub fn log_dir() -> PathBuf {
    std::env::var("CHIPGATE_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| crate::config::chipgate_home().join("logs"))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// stops the background file writer.
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let stderr_layer = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(true).with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = if let Some(appender) = file_appender(&config)? {
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(debug_mode = config.debug_mode, file = ?config.file, "Logging initialized");
    Ok(guard)
}

/// Where the file layer writes, if anywhere.
fn file_target(config: &LogConfig) -> Option<(PathBuf, Rotation, String)> {
    if let Some(file) = &config.file {
        let dir = match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| LOG_FILE_PREFIX.to_string());
        return Some((dir, Rotation::NEVER, name));
    }
    if config.debug_mode {
        let dir = config.log_dir.clone().unwrap_or_else(log_dir);
        return Some((dir, Rotation::DAILY, LOG_FILE_PREFIX.to_string()));
    }
    None
}

fn file_appender(config: &LogConfig) -> Result<Option<RollingFileAppender>> {
    let Some((dir, rotation, name)) = file_target(config) else {
        return Ok(None);
    };
    create_log_dir(&dir)?;
    Ok(Some(RollingFileAppender::new(rotation, &dir, name)))
}

fn create_log_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory: {:?}", dir))
}

/// Rolled log files in the log directory, oldest first.
pub fn log_files() -> Result<Vec<PathBuf>> {
    let dir = log_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<(SystemTime, PathBuf)> = fs::read_dir(&dir)
        .with_context(|| format!("Failed to read log directory: {:?}", dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Delete rolled log files older than `days`. Returns how many were removed.
pub fn cleanup_old_logs(days: u64) -> Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for path in log_files()? {
        let modified = fs::metadata(&path).and_then(|m| m.modified());
        if let Ok(modified) = modified
            && modified < cutoff
        {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove old log {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}
