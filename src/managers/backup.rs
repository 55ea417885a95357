//! Backup orchestrator - runs one backup end to end
//!
//! capture → transforms → checksum → upload → registry → verification, inside
//! a per-job run lock and a scoped workspace. Whatever happens, the record
//! never stays `Running` and the workspace is removed before returning.

use super::notification::{BackupEvent, EventKind};
use super::verify::{record_verification, stored_checksum};
use super::Services;
use crate::config::{validate_job_name, BackupConfig};
use crate::error::EngineError;
use crate::registry::{keys, BackupRecord, BackupRegistry, BackupStatus};
use crate::strategies::SourceCapturer;
use crate::transform::{StageKind, TransformPipeline};
use crate::storage::StorageBackend;
use crate::utils::cancel::CancelToken;
use chrono::Utc;
use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

pub struct BackupOrchestrator {
    services: Arc<Services>,
}

/// Marks the record `Failed` if the run unwinds before settling it
struct FailOnDrop<'a> {
    registry: &'a BackupRegistry,
    id: &'a str,
    armed: bool,
}

impl FailOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FailOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Backup {} aborted before completion", self.id);
            mark_failed(self.registry, self.id, "aborted", "run aborted before completion", None);
        }
    }
}

/// Reports `LongRunning` once per run when the threshold is crossed
struct LongRunWatch {
    started: Instant,
    threshold: Option<Duration>,
    reported: Cell<bool>,
}

impl LongRunWatch {
    fn exceeded(&self) -> Option<Duration> {
        let threshold = self.threshold?;
        let elapsed = self.started.elapsed();
        if elapsed > threshold && !self.reported.replace(true) {
            Some(elapsed)
        } else {
            None
        }
    }
}

/// Move a running record to `Failed`, recording the cause
fn mark_failed(registry: &BackupRegistry, id: &str, kind: &str, message: &str, duration: Option<Duration>) {
    let result = registry.update(id, |record| {
        if matches!(record.status, BackupStatus::Pending | BackupStatus::Running) {
            record.transition(BackupStatus::Failed)?;
            record
                .metadata
                .insert(keys::ERROR.to_string(), message.to_string());
            record
                .metadata
                .insert(keys::ERROR_KIND.to_string(), kind.to_string());
            if let Some(duration) = duration {
                record.duration_seconds = duration.as_secs_f64();
            }
        }
        Ok(())
    });
    if let Err(e) = result {
        error!("Failed to mark backup {} as failed: {}", id, e);
    }
}

/// Extension of a raw or transformed artifact, e.g. `.sql.bz2.enc`
fn artifact_extension(file_name: &str, job_name: &str) -> String {
    match file_name.strip_prefix(job_name) {
        Some(rest) if rest.starts_with('.') => rest.to_string(),
        _ => file_name
            .find('.')
            .map(|i| file_name[i..].to_string())
            .unwrap_or_default(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl BackupOrchestrator {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run one backup of `config`.
    ///
    /// Returns the settled record: `Completed`, or `Verified` when
    /// verification was requested and passed. A checksum mismatch after upload
    /// returns `EngineError::Corrupted`; the record is then `Corrupted`.
    pub fn run(&self, config: &BackupConfig, cancel: &CancelToken) -> Result<BackupRecord, EngineError> {
        validate_job_name(&config.name).map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let capturer = self.services.capturer(config.kind)?;
        let backend = self.services.storage.get(config.storage_provider)?;

        self.services
            .locks
            .with_lock(&config.name, || self.run_locked(config, capturer, backend, cancel))
    }

    fn run_locked(
        &self,
        config: &BackupConfig,
        capturer: Arc<dyn SourceCapturer>,
        backend: Arc<dyn StorageBackend>,
        cancel: &CancelToken,
    ) -> Result<BackupRecord, EngineError> {
        let started = Instant::now();
        let created_at = Utc::now();
        let id = format!("{}-{}", config.name, created_at.format("%Y%m%d-%H%M%S-%f"));

        let span = info_span!("backup", job = %config.name, backup_id = %id);
        let _enter = span.enter();

        let registry = &self.services.registry;
        registry.create(BackupRecord::pending(&id, config, created_at))?;

        let mut guard = FailOnDrop {
            registry,
            id: &id,
            armed: true,
        };
        registry.transition(&id, BackupStatus::Running)?;
        info!("Starting {} backup '{}' to {}", config.kind, config.name, config.storage_provider);

        let watch = LongRunWatch {
            started,
            threshold: self.services.long_running_threshold,
            reported: Cell::new(false),
        };
        let cancel = self.services.run_token(cancel);
        let result = self.execute(config, &id, capturer.as_ref(), backend.as_ref(), &watch, &cancel);
        let duration = started.elapsed();

        let outcome = match result {
            Ok(record) => {
                info!(
                    "Backup {} finished as {} in {:.2}s ({} bytes)",
                    id,
                    record.status,
                    duration.as_secs_f64(),
                    record.size_bytes
                );
                self.services.report(
                    BackupEvent::new(
                        EventKind::BackupCompleted,
                        &config.name,
                        format!("Backup of '{}' completed", config.name),
                    )
                    .with_record(&record)
                    .with_duration(duration),
                );
                Ok(record)
            }
            Err(err @ EngineError::Corrupted { .. }) => {
                error!("Backup {} failed verification: {}", id, err);
                let record = registry.get(&id)?;
                self.services.report(
                    BackupEvent::new(
                        EventKind::Corrupted,
                        &config.name,
                        format!("Backup of '{}' did not match its checksum after upload", config.name),
                    )
                    .with_record(&record)
                    .with_error(&err)
                    .with_duration(duration),
                );
                Err(err)
            }
            Err(err) => {
                error!("Backup {} failed: {}", id, err);
                mark_failed(registry, &id, err.kind(), &err.to_string(), Some(duration));
                let mut event = BackupEvent::new(
                    EventKind::BackupFailed,
                    &config.name,
                    format!("Backup of '{}' failed", config.name),
                )
                .with_error(&err)
                .with_duration(duration);
                if let Ok(record) = registry.get(&id) {
                    event = event.with_record(&record);
                }
                self.services.report(event);
                Err(err)
            }
        };

        guard.disarm();
        outcome
    }

    fn check_long_running(&self, config: &BackupConfig, id: &str, watch: &LongRunWatch) {
        if let Some(elapsed) = watch.exceeded() {
            warn!("Backup {} has been running for {:?}", id, elapsed);
            let mut event = BackupEvent::new(
                EventKind::LongRunning,
                &config.name,
                format!("Backup of '{}' is taking longer than expected", config.name),
            )
            .with_duration(elapsed);
            event.backup_id = Some(id.to_string());
            event.backup_kind = Some(config.kind);
            event.storage_provider = Some(config.storage_provider);
            self.services.report(event);
        }
    }

    fn execute(
        &self,
        config: &BackupConfig,
        id: &str,
        capturer: &dyn SourceCapturer,
        backend: &dyn StorageBackend,
        watch: &LongRunWatch,
        cancel: &CancelToken,
    ) -> Result<BackupRecord, EngineError> {
        let services = &self.services;
        let workspace = services.workspace(id)?;

        // Capture
        cancel.check()?;
        let artifact = capturer.capture(config, workspace.path(), cancel)?;
        let raw = services.verifier.digest(&artifact.path, cancel)?;
        let artifact_name = file_name(&artifact.path);
        info!("Captured {} ({} bytes)", artifact_name, raw.size_bytes);
        self.check_long_running(config, id, watch);

        // Transform
        let pipeline = TransformPipeline::for_flags(services.transforms.as_ref(), config.compress, config.encrypt)?;
        let stored_path = pipeline.forward(&artifact.path, workspace.path(), true, cancel)?;
        let stored = services.verifier.digest(&stored_path, cancel)?;
        debug!("Transformed with [{}] into {:?}", pipeline.names(), stored_path);
        self.check_long_running(config, id, watch);

        // Upload
        let key = format!(
            "{}/{}/{}{}",
            config.kind,
            config.name,
            id,
            artifact_extension(&file_name(&stored_path), &config.name)
        );
        cancel.check()?;
        let uri = backend.put(&key, &stored_path, cancel)?;
        info!("Stored {} bytes at {}", stored.size_bytes, uri);
        self.check_long_running(config, id, watch);

        let mut engine_metadata = artifact.metadata.clone();
        engine_metadata.insert(keys::JOB_NAME.to_string(), config.name.clone());
        engine_metadata.insert(keys::TRANSFORMS.to_string(), pipeline.names());
        for stage in pipeline.stages() {
            let key = match stage.kind() {
                StageKind::Compress => keys::COMPRESSION,
                StageKind::Encrypt => keys::ENCRYPTION,
            };
            engine_metadata.insert(key.to_string(), stage.algorithm().to_string());
        }
        engine_metadata.insert(keys::RAW_CHECKSUM.to_string(), raw.checksum.clone());
        engine_metadata.insert(keys::RAW_SIZE_BYTES.to_string(), raw.size_bytes.to_string());
        engine_metadata.insert(keys::STORAGE_KEY.to_string(), key.clone());
        engine_metadata.insert(keys::ARTIFACT_NAME.to_string(), artifact_name);

        let duration = watch.started.elapsed();
        let record = services.registry.update(id, |record| {
            record.location_uri = Some(uri.clone());
            record.checksum = Some(stored.checksum.clone());
            record.size_bytes = stored.size_bytes;
            record.duration_seconds = duration.as_secs_f64();
            record.metadata.extend(engine_metadata.clone());
            record.transition(BackupStatus::Completed)?;
            Ok(())
        })?;

        if !config.verify_integrity {
            return Ok(record);
        }

        // Verify
        let verified = stored_checksum(services, &record, &workspace, cancel)
            .and_then(|actual| record_verification(services, id, &stored.checksum, &actual));
        match verified {
            Ok(result) if result.is_intact() => Ok(services.registry.get(id)?),
            Ok(result) => Err(EngineError::Corrupted {
                id: id.to_string(),
                expected: result.expected,
                actual: result.actual,
            }),
            Err(err @ EngineError::Cancelled(_)) => Err(err),
            Err(err) => {
                warn!("Could not verify backup {}: {}", id, err);
                let message = err.to_string();
                Ok(services.registry.update(id, |record| {
                    record
                        .metadata
                        .insert(keys::VERIFY_ERROR.to_string(), message.clone());
                    Ok(())
                })?)
            }
        }
    }
}
