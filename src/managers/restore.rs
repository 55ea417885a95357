//! Restore orchestrator - the backup pipeline in reverse
//!
//! registry lookup → fetch → inverse transforms → raw checksum → apply.
//! Nothing is written to a target system until the raw artifact has been
//! checked against the checksum recorded before the forward transforms.

use super::notification::{BackupEvent, EventKind};
use super::Services;
use crate::config::BackupKind;
use crate::error::EngineError;
use crate::integrity::IntegrityError;
use crate::registry::{keys, BackupRecord, BackupStatus};
use crate::storage::StorageError;
use crate::strategies::RestoreTarget;
use crate::transform::TransformPipeline;
use crate::utils::cancel::CancelToken;
use crate::utils::workspace::RunWorkspace;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    /// Fetch, verify and apply to the target system
    #[default]
    Full,
    /// Fetch and verify only; no external system is touched
    VerifyOnly,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub mode: RestoreMode,
    /// Extraction directory for file-tree, media and config snapshot restores
    pub target_dir: Option<PathBuf>,
    /// Load a database backup into this database instead of the configured one
    pub database_url: Option<String>,
}

impl RestoreOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn verify_only() -> Self {
        Self {
            mode: RestoreMode::VerifyOnly,
            ..Self::default()
        }
    }

    pub fn with_target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = Some(dir.into());
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub backup_id: String,
    pub kind: BackupKind,
    pub mode: RestoreMode,
    /// Checksum of the reconstructed raw artifact, matching `raw_checksum`
    pub raw_checksum: String,
    /// Whether the artifact was applied to a target system
    pub applied: bool,
    /// Checksum of the target's state just before it was overwritten
    pub pre_restore_checksum: Option<String>,
    pub duration: Duration,
}

pub struct RestoreOrchestrator {
    services: Arc<Services>,
}

fn needs_target_dir(kind: BackupKind) -> bool {
    matches!(
        kind,
        BackupKind::FileTree | BackupKind::MediaArchive | BackupKind::ConfigSnapshot
    )
}

impl RestoreOrchestrator {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Restore backup `id`.
    ///
    /// Unknown and deleted ids fail with `NotFound` before anything is
    /// fetched or written. Database and user-data restores overwrite the
    /// target.
    pub fn run(&self, id: &str, options: &RestoreOptions, cancel: &CancelToken) -> Result<RestoreResult, EngineError> {
        let record = self
            .services
            .registry
            .find(id)?
            .filter(|r| r.status != BackupStatus::Deleted)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        match record.status {
            BackupStatus::Completed | BackupStatus::Verified => {}
            BackupStatus::Corrupted => {
                return Err(EngineError::Corrupted {
                    id: id.to_string(),
                    expected: record.checksum.clone().unwrap_or_default(),
                    actual: "recorded as corrupted".to_string(),
                });
            }
            status => {
                return Err(EngineError::InvalidRequest(format!(
                    "backup {} is {} and cannot be restored",
                    id, status
                )));
            }
        }

        if options.mode == RestoreMode::Full && needs_target_dir(record.kind) && options.target_dir.is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "{} restores need a target directory",
                record.kind
            )));
        }

        let job_name = record.job_name().unwrap_or(id).to_string();
        let span = info_span!("restore", job = %job_name, backup_id = %id);
        let _enter = span.enter();

        let started = Instant::now();
        let cancel = self.services.run_token(cancel);
        let result = self.execute(&record, options, &cancel, started);

        match &result {
            Ok(result) => {
                info!(
                    "Restore of {} finished in {:.2}s (applied: {})",
                    id,
                    result.duration.as_secs_f64(),
                    result.applied
                );
                if result.applied {
                    self.services.report(
                        BackupEvent::new(
                            EventKind::RestoreCompleted,
                            &job_name,
                            format!("Backup {} restored", id),
                        )
                        .with_record(&record)
                        .with_duration(result.duration),
                    );
                }
            }
            Err(err) => {
                error!("Restore of {} failed: {}", id, err);
                self.services.report(
                    BackupEvent::new(
                        EventKind::RestoreFailed,
                        &job_name,
                        format!("Restore of backup {} failed", id),
                    )
                    .with_record(&record)
                    .with_error(err)
                    .with_duration(started.elapsed()),
                );
            }
        }
        result
    }

    fn execute(
        &self,
        record: &BackupRecord,
        options: &RestoreOptions,
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<RestoreResult, EngineError> {
        let services = &self.services;
        let raw_expected = record
            .raw_checksum()
            .ok_or(IntegrityError::MissingChecksum("raw"))?
            .to_string();
        let pipeline = TransformPipeline::from_names(services.transforms.as_ref(), record.transforms())?;
        let capturer = match options.mode {
            RestoreMode::Full => Some(services.capturer(record.kind)?),
            RestoreMode::VerifyOnly => None,
        };

        let workspace = services.workspace(&format!("restore-{}", record.id))?;

        // Fetch
        cancel.check()?;
        let (fetched, owned) = self.fetch(record, &workspace, cancel)?;
        debug!("Fetched artifact to {:?}", fetched);

        // Inverse transforms, then raw checksum
        let raw = pipeline.inverse(&fetched, workspace.path(), owned, cancel)?;
        let raw_checksum = services.verifier.ensure(&raw, &raw_expected, cancel)?;
        info!("Raw artifact matches {}", raw_checksum);

        let Some(capturer) = capturer else {
            return Ok(RestoreResult {
                backup_id: record.id.clone(),
                kind: record.kind,
                mode: options.mode,
                raw_checksum,
                applied: false,
                pre_restore_checksum: None,
                duration: started.elapsed(),
            });
        };

        // Apply
        let artifact = self.stage_raw(record, &raw, &workspace)?;
        let target = RestoreTarget {
            target_dir: options.target_dir.clone(),
            database_url: options.database_url.clone(),
        };

        let mut pre_restore_checksum = None;
        if record.kind.is_destructive_restore() {
            warn!(
                "Restoring {} backup {} overwrites the current target state",
                record.kind, record.id
            );
            pre_restore_checksum = capturer.current_state_checksum(&target, workspace.path(), cancel);
            match &pre_restore_checksum {
                Some(sum) => info!("Target state before restore: {}", sum),
                None => debug!("Target state checksum not available"),
            }
        }

        cancel.check()?;
        capturer.restore(&artifact, &target, workspace.path(), cancel)?;

        Ok(RestoreResult {
            backup_id: record.id.clone(),
            kind: record.kind,
            mode: options.mode,
            raw_checksum,
            applied: true,
            pre_restore_checksum,
            duration: started.elapsed(),
        })
    }

    /// Path of the stored artifact on local disk and whether it belongs to
    /// the workspace. Local artifacts are read in place.
    fn fetch(
        &self,
        record: &BackupRecord,
        workspace: &RunWorkspace,
        cancel: &CancelToken,
    ) -> Result<(PathBuf, bool), EngineError> {
        let uri = record.location_uri.as_deref().ok_or_else(|| {
            EngineError::InvalidRequest(format!("backup {} has no stored artifact", record.id))
        })?;
        let backend = self.services.storage.get(record.storage_provider)?;

        if let Some(path) = backend.local_path(uri) {
            if !path.is_file() {
                return Err(StorageError::NotFound(uri.to_string()).into());
            }
            return Ok((path, false));
        }

        let name = uri.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("artifact");
        let dest = workspace.file(name);
        backend.get(uri, &dest, cancel)?;
        Ok((dest, true))
    }

    /// Give the raw artifact its original file name inside the workspace
    fn stage_raw(&self, record: &BackupRecord, raw: &Path, workspace: &RunWorkspace) -> Result<PathBuf, EngineError> {
        let Some(name) = record.meta(keys::ARTIFACT_NAME) else {
            return Ok(raw.to_path_buf());
        };
        let dest = workspace.file(name);
        if dest == raw {
            return Ok(dest);
        }

        let moved = if workspace.contains(raw) {
            fs::rename(raw, &dest)
        } else {
            fs::copy(raw, &dest).map(|_| ())
        };
        moved.map_err(|e| EngineError::workspace(&dest, e))?;
        Ok(dest)
    }
}
