//! Integrity verification of stored artifacts

use super::notification::{BackupEvent, EventKind};
use super::Services;
use crate::error::EngineError;
use crate::integrity::{Checksum, IntegrityError};
use crate::registry::{keys, BackupRecord, BackupStatus};
use crate::storage::StorageError;
use crate::utils::cancel::CancelToken;
use crate::utils::workspace::RunWorkspace;
use chrono::{DateTime, Utc};
use std::fs;
use std::sync::Arc;
use tracing::{info, info_span, warn};

/// Outcome of re-checking a stored artifact
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyResult {
    pub backup_id: String,
    /// `Verified` or `Corrupted`
    pub status: BackupStatus,
    pub expected: String,
    pub actual: String,
    pub verified_at: DateTime<Utc>,
}

impl VerifyResult {
    pub fn is_intact(&self) -> bool {
        self.status == BackupStatus::Verified
    }
}

/// Checksum of the artifact as it currently sits in storage.
///
/// Local artifacts are hashed in place; remote ones are downloaded into
/// `scratch` first and the download is removed afterwards.
pub(crate) fn stored_checksum(
    services: &Services,
    record: &BackupRecord,
    scratch: &RunWorkspace,
    cancel: &CancelToken,
) -> Result<String, EngineError> {
    let uri = record.location_uri.as_deref().ok_or_else(|| {
        EngineError::InvalidRequest(format!("backup {} has no stored artifact", record.id))
    })?;
    let backend = services.storage.get(record.storage_provider)?;

    if let Some(path) = backend.local_path(uri) {
        if !path.is_file() {
            return Err(StorageError::NotFound(uri.to_string()).into());
        }
        return Ok(services.verifier.checksum(&path, cancel)?);
    }

    let download = scratch.file("verify.download");
    backend.get(uri, &download, cancel)?;
    let checksum = services.verifier.checksum(&download, cancel);
    if let Err(e) = fs::remove_file(&download) {
        warn!("Failed to remove verification download {:?}: {}", download, e);
    }
    Ok(checksum?)
}

/// Compare checksums and move the record to `Verified` or `Corrupted`
pub(crate) fn record_verification(
    services: &Services,
    id: &str,
    expected: &str,
    actual: &str,
) -> Result<VerifyResult, EngineError> {
    let expected_sum: Checksum = expected.parse()?;
    let actual_sum: Checksum = actual.parse()?;
    let status = if expected_sum == actual_sum {
        BackupStatus::Verified
    } else {
        BackupStatus::Corrupted
    };

    let now = Utc::now();
    services.registry.update(id, |record| {
        record.transition(status)?;
        record.verified_at = Some(now);
        record.metadata.remove(keys::VERIFY_ERROR);
        Ok(())
    })?;

    Ok(VerifyResult {
        backup_id: id.to_string(),
        status,
        expected: expected.to_string(),
        actual: actual.to_string(),
        verified_at: now,
    })
}

/// Re-verifies stored artifacts on request
pub struct IntegrityChecker {
    services: Arc<Services>,
}

impl IntegrityChecker {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Fetch the stored artifact, re-checksum it and record the outcome.
    ///
    /// A mismatch is a successful call with status `Corrupted`; errors mean
    /// the check itself could not run and leave the record untouched.
    pub fn verify(&self, id: &str, cancel: &CancelToken) -> Result<VerifyResult, EngineError> {
        let record = self
            .services
            .registry
            .find(id)?
            .filter(|r| r.status != BackupStatus::Deleted)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if !record.status.has_artifact() {
            return Err(EngineError::InvalidRequest(format!(
                "backup {} is {} and has no artifact to verify",
                id, record.status
            )));
        }
        let expected = record
            .checksum
            .clone()
            .ok_or(IntegrityError::MissingChecksum("stored"))?;

        let span = info_span!("verify", backup_id = %id);
        let _enter = span.enter();

        let cancel = self.services.run_token(cancel);
        let scratch = self.services.workspace(&format!("verify-{}", id))?;
        let actual = stored_checksum(&self.services, &record, &scratch, &cancel)?;
        let result = record_verification(&self.services, id, &expected, &actual)?;

        if result.is_intact() {
            info!("Backup {} verified", id);
        } else {
            warn!("Backup {} is corrupted: expected {}, got {}", id, expected, actual);
            let err = EngineError::Corrupted {
                id: id.to_string(),
                expected: expected.clone(),
                actual: actual.clone(),
            };
            self.services.report(
                BackupEvent::new(
                    EventKind::Corrupted,
                    record.job_name().unwrap_or(id),
                    format!("Stored artifact of backup {} no longer matches its checksum", id),
                )
                .with_record(&record)
                .with_error(&err),
            );
        }

        Ok(result)
    }
}
