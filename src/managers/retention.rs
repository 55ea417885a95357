//! Retention sweeps and operator purges
//!
//! The stored artifact is always deleted before the record is marked
//! `Deleted`. A record whose artifact could not be deleted stays as it was
//! and is picked up again by the next sweep.

use super::notification::{BackupEvent, EventKind};
use super::Services;
use crate::config::{BackupKind, Frequency};
use crate::error::EngineError;
use crate::registry::{BackupRecord, BackupStatus, RecordFilter};
use crate::storage::StorageError;
use crate::utils::cancel::CancelToken;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

/// Outcome of one sweep
#[derive(Debug, Clone)]
pub struct SweepResult {
    pub kind: BackupKind,
    pub frequency: Frequency,
    /// Records created strictly before this instant were eligible
    pub cutoff: DateTime<Utc>,
    /// Ids whose artifact and record were removed
    pub deleted: Vec<String>,
    /// Ids that were eligible but could not be removed, with the cause
    pub failed: Vec<(String, String)>,
    /// Completed or verified records of this kind and frequency still kept
    pub retained: usize,
}

impl SweepResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct RetentionManager {
    services: Arc<Services>,
}

impl RetentionManager {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Remove completed and verified backups of `kind`/`frequency` older
    /// than `retention_days`
    pub fn sweep(
        &self,
        kind: BackupKind,
        frequency: Frequency,
        retention_days: u32,
        cancel: &CancelToken,
    ) -> Result<SweepResult, EngineError> {
        self.sweep_at(kind, frequency, retention_days, Utc::now(), cancel)
    }

    /// `sweep` with an explicit notion of "now"
    pub fn sweep_at(
        &self,
        kind: BackupKind,
        frequency: Frequency,
        retention_days: u32,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<SweepResult, EngineError> {
        let cutoff = now - ChronoDuration::days(i64::from(retention_days));
        let span = info_span!("sweep", kind = %kind, frequency = %frequency);
        let _enter = span.enter();

        let cancel = self.services.run_token(cancel);
        let retained_filter = RecordFilter::new()
            .kind(kind)
            .frequency(frequency)
            .status(BackupStatus::Completed)
            .status(BackupStatus::Verified);
        let expired = self
            .services
            .registry
            .query(&retained_filter.clone().created_before(cutoff))?;

        info!(
            "Sweeping {} {} backups created before {} ({} eligible)",
            frequency,
            kind,
            cutoff.format("%Y-%m-%d %H:%M:%S"),
            expired.len()
        );

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for record in &expired {
            cancel.check()?;
            match self.remove(record, &cancel) {
                Ok(()) => deleted.push(record.id.clone()),
                Err(err @ EngineError::Cancelled(_)) => return Err(err),
                Err(err) => {
                    warn!("Keeping backup {}: {}", record.id, err);
                    failed.push((record.id.clone(), err.to_string()));
                }
            }
        }

        let retained = self.services.registry.query(&retained_filter)?.len();
        let result = SweepResult {
            kind,
            frequency,
            cutoff,
            deleted,
            failed,
            retained,
        };

        info!(
            "Sweep finished: {} deleted, {} failed, {} retained",
            result.deleted.len(),
            result.failed.len(),
            result.retained
        );
        if !result.deleted.is_empty() || !result.failed.is_empty() {
            let mut event = BackupEvent::new(
                EventKind::RetentionSwept,
                format!("{}-{}", kind, frequency),
                format!(
                    "Removed {} expired {} {} backups ({} failed)",
                    result.deleted.len(),
                    frequency,
                    kind,
                    result.failed.len()
                ),
            );
            event.backup_kind = Some(kind);
            if let Some((_, cause)) = result.failed.first() {
                event.error = Some(cause.clone());
            }
            self.services.report(event);
        }

        Ok(result)
    }

    /// Delete backup `id` regardless of its age
    pub fn purge(&self, id: &str, cancel: &CancelToken) -> Result<BackupRecord, EngineError> {
        let record = self
            .services
            .registry
            .find(id)?
            .filter(|r| r.status != BackupStatus::Deleted)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if matches!(record.status, BackupStatus::Pending | BackupStatus::Running) {
            return Err(EngineError::InvalidRequest(format!(
                "backup {} is still {}",
                id, record.status
            )));
        }

        let span = info_span!("purge", backup_id = %id);
        let _enter = span.enter();

        let cancel = self.services.run_token(cancel);
        self.remove(&record, &cancel)?;
        info!("Purged backup {}", id);
        Ok(self.services.registry.get(id)?)
    }

    /// Remove the registry entry of a backup that holds no artifact.
    ///
    /// Only `Deleted` and `Failed` records qualify; anything else still
    /// points at a stored artifact and must be purged first.
    pub fn forget(&self, id: &str) -> Result<BackupRecord, EngineError> {
        let record = self
            .services
            .registry
            .find(id)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if !matches!(record.status, BackupStatus::Deleted | BackupStatus::Failed) {
            return Err(EngineError::InvalidRequest(format!(
                "backup {} is {}; purge it before forgetting it",
                id, record.status
            )));
        }

        if !self.services.registry.forget(id)? {
            return Err(EngineError::NotFound(id.to_string()));
        }
        info!("Forgot {} backup {}", record.status, id);
        Ok(record)
    }

    /// Delete the stored artifact, then mark the record deleted
    fn remove(&self, record: &BackupRecord, cancel: &CancelToken) -> Result<(), EngineError> {
        if let Some(uri) = record.location_uri.as_deref() {
            let backend = self.services.storage.get(record.storage_provider)?;
            match backend.delete(uri, cancel) {
                Ok(()) => debug!("Deleted artifact {}", uri),
                Err(StorageError::NotFound(_)) => debug!("Artifact {} already gone", uri),
                Err(e) => return Err(e.into()),
            }
        }
        self.services
            .registry
            .transition(&record.id, BackupStatus::Deleted)?;
        Ok(())
    }
}
