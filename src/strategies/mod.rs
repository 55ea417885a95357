//! Source capturers, one per backup kind
//!
//! A capturer turns a live source (database, file tree, configuration, user
//! data, media directories) into one raw artifact inside the run's work
//! directory, and applies such an artifact back on restore.

pub mod config_snapshot;
pub mod database;
pub mod file_tree;
pub mod media;
pub mod user_data;

pub use config_snapshot::{ConfigSnapshotCapturer, ConfigSource, EngineConfigSource};
pub use database::DatabaseCapturer;
pub use file_tree::FileTreeCapturer;
pub use media::MediaArchiveCapturer;
pub use user_data::{UserDataCapturer, UserDataSink, UserDataSource};

use crate::config::{BackupConfig, BackupKind};
use crate::utils::archive::ArchiveError;
use crate::utils::cancel::{CancelToken, Cancelled};
use crate::utils::command::CommandError;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Archive(ArchiveError),

    #[error("{0}")]
    Command(CommandError),

    #[error("required tool '{0}' is not installed")]
    ToolMissing(String),

    #[error("source path does not exist: {0:?}")]
    SourceMissing(PathBuf),

    #[error("nothing to capture: {0}")]
    NothingToCapture(String),

    #[error("source failed: {0}")]
    Source(String),

    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Cancelled(Cancelled),
}

impl CaptureError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        CaptureError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<Cancelled> for CaptureError {
    fn from(reason: Cancelled) -> Self {
        CaptureError::Cancelled(reason)
    }
}

impl From<ArchiveError> for CaptureError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Cancelled(reason) => CaptureError::Cancelled(reason),
            other => CaptureError::Archive(other),
        }
    }
}

impl From<CommandError> for CaptureError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled(reason) => CaptureError::Cancelled(reason),
            other => CaptureError::Command(other),
        }
    }
}

/// Failure while applying an artifact to its target system
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("restore target missing: {0}")]
    MissingTarget(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Archive(ArchiveError),

    #[error("{0}")]
    Command(CommandError),

    #[error("required tool '{0}' is not installed")]
    ToolMissing(String),

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("target rejected the data: {0}")]
    Target(String),

    #[error(transparent)]
    Cancelled(Cancelled),
}

impl ApplyError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ApplyError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<Cancelled> for ApplyError {
    fn from(reason: Cancelled) -> Self {
        ApplyError::Cancelled(reason)
    }
}

impl From<ArchiveError> for ApplyError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Cancelled(reason) => ApplyError::Cancelled(reason),
            other => ApplyError::Archive(other),
        }
    }
}

impl From<CommandError> for ApplyError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled(reason) => ApplyError::Cancelled(reason),
            other => ApplyError::Command(other),
        }
    }
}

/// Raw artifact produced by a capturer
#[derive(Debug, Clone)]
pub struct CapturedArtifact {
    pub path: PathBuf,
    /// Kind-specific facts recorded on the backup record
    pub metadata: BTreeMap<String, String>,
}

impl CapturedArtifact {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Where a restore writes to
#[derive(Debug, Clone, Default)]
pub struct RestoreTarget {
    /// Directory receiving extracted files (file tree, media, config snapshot)
    pub target_dir: Option<PathBuf>,
    /// Database to load into instead of the configured one
    pub database_url: Option<String>,
}

impl RestoreTarget {
    pub(crate) fn require_dir(&self, kind: BackupKind) -> Result<&Path, ApplyError> {
        self.target_dir
            .as_deref()
            .ok_or_else(|| ApplyError::MissingTarget(format!("{} restores need a target directory", kind)))
    }
}

/// Trait for source capture strategies
pub trait SourceCapturer: Send + Sync {
    fn kind(&self) -> BackupKind;

    /// Produce the raw artifact inside `work_dir`.
    ///
    /// On failure nothing is left outside `work_dir`, and any partial output
    /// inside it has been removed.
    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError>;

    /// Apply a raw artifact to its target system
    fn restore(
        &self,
        artifact: &Path,
        target: &RestoreTarget,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ApplyError>;

    /// Checksum of the target's current state, logged before a destructive
    /// restore. `None` when the target cannot provide one.
    fn current_state_checksum(
        &self,
        _target: &RestoreTarget,
        _work_dir: &Path,
        _cancel: &CancelToken,
    ) -> Option<String> {
        None
    }
}

/// Capturers keyed by the kind they handle
#[derive(Clone, Default)]
pub struct CapturerSet {
    capturers: HashMap<BackupKind, Arc<dyn SourceCapturer>>,
}

impl CapturerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the capturer for its kind
    pub fn register(&mut self, capturer: Arc<dyn SourceCapturer>) {
        self.capturers.insert(capturer.kind(), capturer);
    }

    pub fn with(mut self, capturer: Arc<dyn SourceCapturer>) -> Self {
        self.register(capturer);
        self
    }

    pub fn get(&self, kind: BackupKind) -> Option<Arc<dyn SourceCapturer>> {
        self.capturers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<BackupKind> {
        let mut kinds: Vec<_> = self.capturers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// File name of a raw artifact for a job
pub(crate) fn artifact_file_name(config: &BackupConfig, extension: &str) -> String {
    format!("{}.{}", config.name, extension)
}

/// Remove a partially written capture output
pub(crate) fn discard(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial capture output {:?}: {}", path, e);
        }
    }
}

/// Run `produce` and remove `output` if it fails
pub(crate) fn produce_or_discard<T, E, F>(output: &Path, produce: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    let result = produce();
    if result.is_err() {
        discard(output);
    }
    result
}
