//! Backup records and their lifecycle

use crate::config::{BackupConfig, BackupKind, Frequency, StorageProvider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata keys written by the engine
pub mod keys {
    pub const JOB_NAME: &str = "job_name";
    pub const TRANSFORMS: &str = "transforms";
    pub const COMPRESSION: &str = "compression";
    pub const ENCRYPTION: &str = "encryption";
    pub const RAW_CHECKSUM: &str = "raw_checksum";
    pub const RAW_SIZE_BYTES: &str = "raw_size_bytes";
    pub const STORAGE_KEY: &str = "storage_key";
    pub const ARTIFACT_NAME: &str = "artifact_name";
    pub const ERROR: &str = "error";
    pub const ERROR_KIND: &str = "error_kind";
    pub const VERIFY_ERROR: &str = "verify_error";
    pub const DATABASE_ENGINE: &str = "database_engine";
}

/// Lifecycle state of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Verified,
    Corrupted,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Verified => "verified",
            BackupStatus::Corrupted => "corrupted",
            BackupStatus::Deleted => "deleted",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Completed | Verified | Corrupted, Verified | Corrupted) => true,
            _ => false,
        }
    }

    /// A record whose artifact is stored and eligible for retention
    pub fn is_retained(self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Verified)
    }

    /// A record with an artifact in storage
    pub fn has_artifact(self) -> bool {
        matches!(
            self,
            BackupStatus::Completed | BackupStatus::Verified | BackupStatus::Corrupted
        )
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            BackupStatus::Pending,
            BackupStatus::Running,
            BackupStatus::Completed,
            BackupStatus::Failed,
            BackupStatus::Verified,
            BackupStatus::Corrupted,
            BackupStatus::Deleted,
        ]
        .into_iter()
        .find(|status| status.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown backup status '{}'", s))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("backup {id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: BackupStatus,
    pub to: BackupStatus,
}

/// Durable description of one backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub storage_provider: StorageProvider,
    /// Set once the artifact is stored
    pub location_uri: Option<String>,
    pub size_bytes: u64,
    /// Checksum of the stored (post-transform) artifact
    pub checksum: Option<String>,
    pub frequency: Frequency,
    pub status: BackupStatus,
    pub duration_seconds: f64,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    /// New `Pending` record for a run of `config`
    pub fn pending(id: impl Into<String>, config: &BackupConfig, created_at: DateTime<Utc>) -> Self {
        let mut metadata = config.metadata.clone();
        metadata.insert(keys::JOB_NAME.to_string(), config.name.clone());

        Self {
            id: id.into(),
            kind: config.kind,
            storage_provider: config.storage_provider,
            location_uri: None,
            size_bytes: 0,
            checksum: None,
            frequency: config.frequency,
            status: BackupStatus::Pending,
            duration_seconds: 0.0,
            metadata,
            created_at,
            verified_at: None,
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn transition(&mut self, next: BackupStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn job_name(&self) -> Option<&str> {
        self.meta(keys::JOB_NAME)
    }

    pub fn raw_checksum(&self) -> Option<&str> {
        self.meta(keys::RAW_CHECKSUM)
    }

    /// Forward transform stage names in the order they were applied
    pub fn transforms(&self) -> &str {
        self.meta(keys::TRANSFORMS).unwrap_or("")
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Criteria for querying records; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kind: Option<BackupKind>,
    pub frequency: Option<Frequency>,
    pub statuses: Vec<BackupStatus>,
    pub job_name: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: BackupKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn status(mut self, status: BackupStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    /// Only records created strictly before `cutoff`
    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.kind.map_or(true, |k| record.kind == k)
            && self.frequency.map_or(true, |f| record.frequency == f)
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self
                .job_name
                .as_deref()
                .map_or(true, |name| record.job_name() == Some(name))
            && self.created_before.map_or(true, |cutoff| record.created_at < cutoff)
    }
}
