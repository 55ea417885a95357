//! Configuration snapshot strategy
//!
//! Serializes a structured configuration object to one JSON file with every
//! secret redacted, so the snapshot can be stored without leaking credentials.

use super::{
    artifact_file_name, produce_or_discard, ApplyError, CaptureError, CapturedArtifact,
    RestoreTarget, SourceCapturer,
};
use crate::config::{BackupConfig, BackupKind, Config};
use crate::utils::cancel::CancelToken;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Replacement for redacted values
pub const REDACTED: &str = "***REDACTED***";

/// Key fragments that mark a value as secret (matched case-insensitively)
const SECRET_PATTERNS: &[&str] = &["password", "secret", "token", "key", "credential", "webhook"];

/// Query parameter names that carry credentials, on top of `SECRET_PATTERNS`
const SECRET_QUERY_PARAMS: &[&str] = &["sig", "signature", "auth", "pwd", "passwd"];

/// Format version of the snapshot document
const SNAPSHOT_VERSION: u32 = 1;

/// Provides the structured configuration to snapshot
pub trait ConfigSource: Send + Sync {
    /// Human-readable name of the source, recorded in the snapshot
    fn name(&self) -> &str;

    fn snapshot(&self) -> Result<Value, String>;
}

/// Snapshots the engine's own loaded configuration
pub struct EngineConfigSource {
    config: Config,
}

impl EngineConfigSource {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigSource for EngineConfigSource {
    fn name(&self) -> &str {
        "backup-engine"
    }

    fn snapshot(&self) -> Result<Value, String> {
        serde_json::to_value(&self.config).map_err(|e| e.to_string())
    }
}

pub struct ConfigSnapshotCapturer {
    source: Arc<dyn ConfigSource>,
}

impl ConfigSnapshotCapturer {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }
}

/// Redact secret-looking keys and URL credentials, recursively
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                let lower = key.to_lowercase();
                if SECRET_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
                    if !item.is_null() {
                        *item = Value::String(REDACTED.to_string());
                    }
                } else {
                    redact(item);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        Value::String(text) => {
            if let Some(clean) = sanitize_url(text) {
                *text = clean;
            }
        }
        _ => {}
    }
}

fn is_secret_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    SECRET_PATTERNS.iter().any(|pattern| lower.contains(pattern))
        || SECRET_QUERY_PARAMS.iter().any(|param| lower == *param)
}

/// URL with userinfo removed and credential query values redacted, if
/// `text` is a URL carrying either
fn sanitize_url(text: &str) -> Option<String> {
    if !text.contains("://") {
        return None;
    }
    let mut url = Url::parse(text).ok()?;
    let mut changed = false;

    if !url.username().is_empty() || url.password().is_some() {
        url.set_password(None).ok()?;
        url.set_username("").ok()?;
        changed = true;
    }

    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.iter().any(|(name, _)| is_secret_name(name)) {
        let redacted: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(name, value)| {
                if is_secret_name(&name) {
                    (name, REDACTED.to_string())
                } else {
                    (name, value)
                }
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(redacted);
        changed = true;
    }

    changed.then(|| url.to_string())
}

impl SourceCapturer for ConfigSnapshotCapturer {
    fn kind(&self) -> BackupKind {
        BackupKind::ConfigSnapshot
    }

    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError> {
        cancel.check()?;

        let mut snapshot = self.source.snapshot().map_err(CaptureError::Source)?;
        redact(&mut snapshot);

        let document = json!({
            "snapshot_version": SNAPSHOT_VERSION,
            "source": self.source.name(),
            "config": snapshot,
        });
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| CaptureError::Source(format!("failed to serialize snapshot: {}", e)))?;

        let output = work_dir.join(artifact_file_name(config, "json"));
        produce_or_discard(&output, || fs::write(&output, &bytes))
            .map_err(|e| CaptureError::io(&output, e))?;

        info!("Captured configuration snapshot of '{}' ({} bytes)", self.source.name(), bytes.len());
        Ok(CapturedArtifact::new(output))
    }

    fn restore(
        &self,
        artifact: &Path,
        target: &RestoreTarget,
        _work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ApplyError> {
        cancel.check()?;
        let dir = target.require_dir(self.kind())?;

        let contents = fs::read(artifact).map_err(|e| ApplyError::io(artifact, e))?;
        serde_json::from_slice::<Value>(&contents)
            .map_err(|e| ApplyError::InvalidArtifact(format!("snapshot is not valid JSON: {}", e)))?;

        fs::create_dir_all(dir).map_err(|e| ApplyError::io(dir, e))?;
        let name = artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "config-snapshot.json".into());
        let destination = dir.join(name);
        fs::write(&destination, contents).map_err(|e| ApplyError::io(&destination, e))?;

        info!("Restored configuration snapshot to {:?}", destination);
        Ok(())
    }
}
