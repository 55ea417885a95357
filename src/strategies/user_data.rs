//! User data export strategy
//!
//! Domain entities come from a [`UserDataSource`] collaborator, one JSON file
//! per collection, and are archived together with a manifest. Restore hands
//! each collection back to a [`UserDataSink`].

use super::{
    artifact_file_name, discard, produce_or_discard, ApplyError, CaptureError, CapturedArtifact,
    RestoreTarget, SourceCapturer,
};
use crate::config::{BackupConfig, BackupKind};
use crate::integrity::checksum_bytes;
use crate::utils::archive::{entries_under, extract_archive, write_archive};
use crate::utils::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Directory name of the export inside the archive
const EXPORT_DIR: &str = "user-data";
const MANIFEST_FILE: &str = "manifest.json";
const EXPORT_VERSION: u32 = 1;

/// Supplies the platform's domain entities
pub trait UserDataSource: Send + Sync {
    /// Collection names, e.g. `users`, `projects`, `documents`
    fn collections(&self) -> Vec<String>;

    fn export(&self, collection: &str) -> Result<Vec<Value>, String>;
}

/// Receives restored entities; replaces the collection's current contents
pub trait UserDataSink: Send + Sync {
    fn import(&self, collection: &str, records: Vec<Value>) -> Result<(), String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    export_version: u32,
    /// Record count per collection
    collections: BTreeMap<String, usize>,
}

pub struct UserDataCapturer {
    source: Arc<dyn UserDataSource>,
    sink: Option<Arc<dyn UserDataSink>>,
}

impl UserDataCapturer {
    pub fn new(source: Arc<dyn UserDataSource>) -> Self {
        Self { source, sink: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn UserDataSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn collections(&self) -> Result<Vec<String>, String> {
        let mut names = self.source.collections();
        names.sort();
        names.dedup();
        for name in &names {
            validate_collection(name)?;
        }
        Ok(names)
    }

    /// Write one JSON file per collection plus the manifest into `dir`
    fn stage(&self, dir: &Path, cancel: &CancelToken) -> Result<Manifest, CaptureError> {
        let names = self.collections().map_err(CaptureError::InvalidConfig)?;
        if names.is_empty() {
            return Err(CaptureError::NothingToCapture("user data source has no collections".to_string()));
        }

        fs::create_dir_all(dir).map_err(|e| CaptureError::io(dir, e))?;
        let mut manifest = Manifest {
            export_version: EXPORT_VERSION,
            collections: BTreeMap::new(),
        };

        for name in names {
            cancel.check()?;
            let records = self.source.export(&name).map_err(CaptureError::Source)?;
            let path = dir.join(format!("{}.json", name));
            write_json(&path, &records).map_err(CaptureError::Source)?;
            debug!("Exported {} records from '{}'", records.len(), name);
            manifest.collections.insert(name, records.len());
        }

        write_json(&dir.join(MANIFEST_FILE), &manifest).map_err(CaptureError::Source)?;
        Ok(manifest)
    }
}

fn validate_collection(name: &str) -> Result<(), String> {
    let valid = !name.is_empty()
        && name != "manifest"
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid collection name '{}'", name))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| e.to_string())?;
    fs::write(path, bytes).map_err(|e| format!("failed to write {:?}: {}", path, e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ApplyError> {
    let bytes = fs::read(path).map_err(|e| ApplyError::io(path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ApplyError::InvalidArtifact(format!("{:?} is not valid: {}", path, e)))
}

impl SourceCapturer for UserDataCapturer {
    fn kind(&self) -> BackupKind {
        BackupKind::UserDataExport
    }

    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError> {
        cancel.check()?;

        let staging = work_dir.join(format!("{}-export", config.name));
        let output = work_dir.join(artifact_file_name(config, "zip"));

        let result = self.stage(&staging, cancel).and_then(|manifest| {
            let entries = entries_under(&staging, EXPORT_DIR)?;
            produce_or_discard(&output, || write_archive(&entries, &output, cancel))?;
            Ok(manifest)
        });
        discard(&staging);
        let manifest = result?;

        let total: usize = manifest.collections.values().sum();
        info!(
            "Exported {} records across {} collections",
            total,
            manifest.collections.len()
        );
        Ok(CapturedArtifact::new(output)
            .with_metadata("collection_count", manifest.collections.len().to_string())
            .with_metadata("record_count", total.to_string()))
    }

    fn restore(
        &self,
        artifact: &Path,
        _target: &RestoreTarget,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ApplyError> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| ApplyError::MissingTarget("no user data sink configured".to_string()))?;

        let unpacked = work_dir.join("user-data-import");
        let result = (|| -> Result<(), ApplyError> {
            extract_archive(artifact, &unpacked, cancel)?;
            let dir = unpacked.join(EXPORT_DIR);
            let manifest: Manifest = read_json(&dir.join(MANIFEST_FILE))?;

            // Validate everything before the sink sees any of it
            let mut collections = Vec::with_capacity(manifest.collections.len());
            for name in manifest.collections.keys() {
                validate_collection(name).map_err(ApplyError::InvalidArtifact)?;
                let records: Vec<Value> = read_json(&dir.join(format!("{}.json", name)))?;
                collections.push((name.clone(), records));
            }

            for (name, records) in collections {
                cancel.check()?;
                let count = records.len();
                sink.import(&name, records).map_err(ApplyError::Target)?;
                info!("Imported {} records into '{}'", count, name);
            }
            Ok(())
        })();
        discard(&unpacked);
        result
    }

    fn current_state_checksum(
        &self,
        _target: &RestoreTarget,
        _work_dir: &Path,
        _cancel: &CancelToken,
    ) -> Option<String> {
        let mut state = BTreeMap::new();
        for name in self.collections().ok()? {
            state.insert(name.clone(), self.source.export(&name).ok()?);
        }
        let bytes = serde_json::to_vec(&state).ok()?;
        Some(checksum_bytes(&bytes))
    }
}
