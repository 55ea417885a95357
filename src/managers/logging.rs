//! Process-wide tracing setup for the CLI
//!
//! Two sinks: human-readable INFO lines on stderr, and a daily log file in
//! the configured directory at the configured level. The file carries the
//! `backup`/`restore`/`verify`/`sweep` span fields so every line can be tied
//! to a job and backup id.

use crate::config::{expand_tilde, GlobalConfig, LogFormat};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "backup-engine";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_directory: PathBuf,
    /// Level of the file sink; stderr stays at INFO
    pub log_level: Level,
    /// Log files kept after pruning, newest first
    pub max_files: u32,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_directory: std::env::temp_dir().join("backup-engine-logs"),
            log_level: Level::INFO,
            max_files: 10,
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            log_directory: expand_tilde(&global.log_directory),
            log_level: global.log_level.parse().unwrap_or(Level::INFO),
            max_files: global.log_max_files,
            format: global.log_format,
        }
    }
}

/// Keeps the background file writer alive; dropping it flushes pending lines
pub struct LogGuard {
    _file_guard: WorkerGuard,
}

/// Install the stderr and file sinks.
///
/// `RUST_LOG`, when set, overrides both levels.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    fs::create_dir_all(&config.log_directory)
        .with_context(|| format!("Failed to create log directory: {:?}", config.log_directory))?;

    let appender = RollingFileAppender::new(
        Rotation::DAILY,
        &config.log_directory,
        format!("{}.log", LOG_FILE_PREFIX),
    );
    let (writer, file_guard) = tracing_appender::non_blocking(appender);

    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(filter_for(Level::INFO));

    tracing_subscriber::registry()
        .with(file_layer(writer, config.format).with_filter(filter_for(config.log_level)))
        .with(stderr)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let removed = prune_logs(&config.log_directory, config.max_files as usize)?;
    if removed > 0 {
        tracing::debug!("Pruned {} old log file(s) from {:?}", removed, config.log_directory);
    }

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Stderr-only logging for commands that run before the config is trusted
pub fn init_console_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be installed, e.g. by a test harness
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn file_layer<S>(writer: NonBlocking, format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(false).boxed(),
    }
}

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()))
}

/// Delete engine log files beyond the newest `keep`; returns how many went
fn prune_logs(dir: &Path, keep: usize) -> Result<usize> {
    let mut logs: Vec<(SystemTime, PathBuf)> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list log directory: {:?}", dir))?
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{}.log", LOG_FILE_PREFIX))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect();
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in logs.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
