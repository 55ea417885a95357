//! Error taxonomy returned by every engine operation
//!
//! Each layer has its own `thiserror` enum; they all roll up into
//! [`EngineError`], whose variants are what an external scheduler branches
//! on. Only `StorageUnavailable` is worth retrying.

use crate::config::ConfigError;
use crate::integrity::IntegrityError;
use crate::registry::RegistryError;
use crate::storage::StorageError;
use crate::strategies::{ApplyError, CaptureError};
use crate::transform::TransformError;
use crate::utils::cancel::Cancelled;
use crate::utils::locker::LockError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("capture failed: {0}")]
    Capture(CaptureError),

    #[error("transform failed: {0}")]
    Transform(TransformError),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("integrity check failed: {0}")]
    Integrity(IntegrityError),

    /// The stored artifact no longer matches its recorded checksum
    #[error("backup {id} is corrupted: expected {expected}, got {actual}")]
    Corrupted {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(StorageError),

    #[error("artifact missing from storage: {0}")]
    StorageNotFound(StorageError),

    #[error("storage rejected the request: {0}")]
    StorageRejected(StorageError),

    #[error("a run of job '{0}' is already in progress")]
    ConcurrentRun(String),

    #[error("backup not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Cancelled(Cancelled),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("restore failed: {0}")]
    RestoreApply(ApplyError),

    #[error("registry error: {0}")]
    Registry(RegistryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("work directory error on {path}: {source}")]
    Workspace {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Stable name of the error class, recorded in `metadata.error_kind`
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Capture(_) => "capture",
            EngineError::Transform(_) => "transform",
            EngineError::Decryption(_) => "decryption",
            EngineError::Integrity(_) => "integrity",
            EngineError::Corrupted { .. } => "corrupted",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
            EngineError::StorageNotFound(_) => "storage_not_found",
            EngineError::StorageRejected(_) => "storage_rejected",
            EngineError::ConcurrentRun(_) => "concurrent_run",
            EngineError::NotFound(_) => "not_found",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::RestoreApply(_) => "restore_apply",
            EngineError::Registry(_) => "registry",
            EngineError::Config(_) => "config",
            EngineError::Workspace { .. } => "workspace",
        }
    }

    /// Whether the caller may retry the whole operation later
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::StorageUnavailable(_))
    }

    pub(crate) fn workspace(path: &std::path::Path, source: io::Error) -> Self {
        EngineError::Workspace {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<Cancelled> for EngineError {
    fn from(reason: Cancelled) -> Self {
        EngineError::Cancelled(reason)
    }
}

impl From<CaptureError> for EngineError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Cancelled(reason) => EngineError::Cancelled(reason),
            other => EngineError::Capture(other),
        }
    }
}

impl From<TransformError> for EngineError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Decryption(message) => EngineError::Decryption(message),
            TransformError::Cancelled(reason) => EngineError::Cancelled(reason),
            other => EngineError::Transform(other),
        }
    }
}

impl From<IntegrityError> for EngineError {
    fn from(err: IntegrityError) -> Self {
        match err {
            IntegrityError::Cancelled(reason) => EngineError::Cancelled(reason),
            other => EngineError::Integrity(other),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled(reason) => EngineError::Cancelled(reason),
            StorageError::NotFound(_) => EngineError::StorageNotFound(err),
            e if e.is_transient() => EngineError::StorageUnavailable(e),
            e => EngineError::StorageRejected(e),
        }
    }
}

impl From<ApplyError> for EngineError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Cancelled(reason) => EngineError::Cancelled(reason),
            other => EngineError::RestoreApply(other),
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Registry(other),
        }
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held(name) => EngineError::ConcurrentRun(name),
            LockError::Io { path, source } => EngineError::workspace(&path, source),
        }
    }
}
