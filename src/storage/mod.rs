//! Storage backends for finished artifacts
//!
//! Every provider implements `StorageBackend`. Orchestrators only ever talk
//! to the trait, so a new provider is a new implementation plus a line in
//! `StorageRegistry::from_config`.

pub mod azure;
pub mod gcs;
pub mod http;
pub mod local;
pub mod s3;

pub use azure::AzureBackend;
pub use gcs::GcsBackend;
pub use local::LocalBackend;
pub use s3::S3Backend;

use crate::config::{StorageConfig, StorageProvider};
use crate::utils::cancel::{CancelToken, Cancelled, StreamError};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Network failure, timeout, throttling or server error; safe to retry later
    #[error("{provider} storage unavailable: {message}")]
    Unavailable {
        provider: StorageProvider,
        message: String,
    },

    #[error("artifact not found: {0}")]
    NotFound(String),

    /// Authentication, permission or request errors; retrying will not help
    #[error("{provider} storage rejected the request ({status}): {message}")]
    Rejected {
        provider: StorageProvider,
        status: u16,
        message: String,
    },

    #[error("an artifact already exists at {0}")]
    Conflict(String),

    #[error("invalid storage URI '{0}'")]
    InvalidUri(String),

    #[error("failed to sign request: {0}")]
    Signing(String),

    #[error("storage provider '{0}' is not configured")]
    NotConfigured(StorageProvider),

    #[error("local I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn stream(path: &Path, err: StreamError) -> Self {
        match err {
            StreamError::Io(source) => Self::io(path, source),
            StreamError::Cancelled(reason) => StorageError::Cancelled(reason),
        }
    }

    /// Whether the same call may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. } | StorageError::Io { .. })
    }
}

/// Capability set shared by every storage provider.
///
/// `put` is atomic from the caller's point of view: until it returns, nothing
/// is visible through `exists`, `get` or `list`. It never overwrites an
/// existing object.
pub trait StorageBackend: Send + Sync {
    fn provider(&self) -> StorageProvider;

    /// Store `local_path` under `key`; returns the artifact URI
    fn put(&self, key: &str, local_path: &Path, cancel: &CancelToken) -> Result<String, StorageError>;

    /// Download the artifact at `uri` into `dest`
    fn get(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<(), StorageError>;

    fn delete(&self, uri: &str, cancel: &CancelToken) -> Result<(), StorageError>;

    fn exists(&self, uri: &str, cancel: &CancelToken) -> Result<bool, StorageError>;

    /// URIs of every artifact whose key starts with `prefix`, sorted
    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, StorageError>;

    /// Path of the artifact on the local filesystem, if it lives there
    fn local_path(&self, _uri: &str) -> Option<PathBuf> {
        None
    }
}

/// Backends keyed by provider
#[derive(Clone, Default)]
pub struct StorageRegistry {
    backends: HashMap<StorageProvider, Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a backend for every configured provider section
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut registry = Self::new();

        if let Some(local) = &config.local {
            registry.register(Arc::new(LocalBackend::new(&local.base_dir)?));
        }
        if let Some(s3) = &config.s3 {
            registry.register(Arc::new(S3Backend::new(s3.clone())?));
        }
        if let Some(gcs) = &config.gcs {
            registry.register(Arc::new(GcsBackend::new(gcs.clone())?));
        }
        if let Some(azure) = &config.azure {
            registry.register(Arc::new(AzureBackend::new(azure.clone())?));
        }

        Ok(registry)
    }

    /// Add or replace the backend for its provider
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.provider(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, provider: StorageProvider) -> Result<Arc<dyn StorageBackend>, StorageError> {
        self.backends
            .get(&provider)
            .cloned()
            .ok_or(StorageError::NotConfigured(provider))
    }

    pub fn providers(&self) -> Vec<StorageProvider> {
        let mut providers: Vec<_> = self.backends.keys().copied().collect();
        providers.sort();
        providers
    }
}

/// Split `scheme://bucket/key` into bucket and key
pub fn parse_object_uri<'a>(uri: &'a str, scheme: &str) -> Result<(&'a str, &'a str), StorageError> {
    let rest = uri
        .strip_prefix(scheme)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;

    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(StorageError::InvalidUri(uri.to_string())),
    }
}

/// Join a configured key prefix and a key
pub(crate) fn prefixed_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_start_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Reject keys that could escape their namespace
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidUri(key.to_string()));
    }
    Ok(())
}
