//! Durable store of backup records
//!
//! The registry is the only state shared between concurrent runs. Stores
//! guarantee that `create` and `update_by_id` are atomic and that no two
//! records ever share a `location_uri`.

pub mod file;
pub mod memory;
pub mod record;

pub use file::JsonFileRegistry;
pub use memory::InMemoryRegistry;
pub use record::{keys, BackupRecord, BackupStatus, InvalidTransition, RecordFilter};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("backup record not found: {0}")]
    NotFound(String),

    #[error("backup record already exists: {0}")]
    Duplicate(String),

    #[error("location {0} is already referenced by another record")]
    DuplicateLocation(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("registry I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry file {path:?} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// Update applied to one record inside the store's critical section
pub type RecordUpdate<'a> = &'a mut dyn FnMut(&mut BackupRecord) -> Result<(), RegistryError>;

/// Persistence interface for backup records
pub trait RegistryStore: Send + Sync {
    /// Insert a new record; fails if the id or location is taken
    fn create(&self, record: BackupRecord) -> Result<(), RegistryError>;

    /// Apply `update` to the record atomically and return the new version.
    ///
    /// If `update` fails, or the result would duplicate another record's
    /// location, nothing is written.
    fn update_by_id(&self, id: &str, update: RecordUpdate<'_>) -> Result<BackupRecord, RegistryError>;

    fn get(&self, id: &str) -> Result<Option<BackupRecord>, RegistryError>;

    /// Matching records, oldest first
    fn query(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>, RegistryError>;

    /// Remove the record entirely; returns whether it existed
    fn delete(&self, id: &str) -> Result<bool, RegistryError>;
}

pub(crate) fn insert_record(
    records: &mut BTreeMap<String, BackupRecord>,
    record: BackupRecord,
) -> Result<(), RegistryError> {
    if records.contains_key(&record.id) {
        return Err(RegistryError::Duplicate(record.id));
    }
    ensure_unique_location(records, &record)?;
    records.insert(record.id.clone(), record);
    Ok(())
}

pub(crate) fn update_record(
    records: &mut BTreeMap<String, BackupRecord>,
    id: &str,
    update: RecordUpdate<'_>,
) -> Result<BackupRecord, RegistryError> {
    let mut updated = records
        .get(id)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

    update(&mut updated)?;
    updated.id = id.to_string();
    ensure_unique_location(records, &updated)?;

    records.insert(id.to_string(), updated.clone());
    Ok(updated)
}

pub(crate) fn query_records(
    records: &BTreeMap<String, BackupRecord>,
    filter: &RecordFilter,
) -> Vec<BackupRecord> {
    let mut matching: Vec<BackupRecord> = records
        .values()
        .filter(|r| filter.matches(r))
        .cloned()
        .collect();
    matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    matching
}

fn ensure_unique_location(
    records: &BTreeMap<String, BackupRecord>,
    candidate: &BackupRecord,
) -> Result<(), RegistryError> {
    let Some(uri) = candidate.location_uri.as_deref() else {
        return Ok(());
    };
    let taken = records
        .values()
        .any(|r| r.id != candidate.id && r.location_uri.as_deref() == Some(uri));
    if taken {
        return Err(RegistryError::DuplicateLocation(uri.to_string()));
    }
    Ok(())
}

/// Typed access to a [`RegistryStore`] used by the orchestrators
#[derive(Clone)]
pub struct BackupRegistry {
    store: Arc<dyn RegistryStore>,
}

impl BackupRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRegistry::new()))
    }

    pub fn create(&self, record: BackupRecord) -> Result<(), RegistryError> {
        self.store.create(record)
    }

    /// Apply `f` to the record atomically
    pub fn update<F>(&self, id: &str, mut f: F) -> Result<BackupRecord, RegistryError>
    where
        F: FnMut(&mut BackupRecord) -> Result<(), RegistryError>,
    {
        self.store.update_by_id(id, &mut f)
    }

    /// Move the record to `status`
    pub fn transition(&self, id: &str, status: BackupStatus) -> Result<BackupRecord, RegistryError> {
        self.update(id, |record| Ok(record.transition(status)?))
    }

    /// Record by id; `NotFound` if absent
    pub fn get(&self, id: &str) -> Result<BackupRecord, RegistryError> {
        self.store
            .get(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn find(&self, id: &str) -> Result<Option<BackupRecord>, RegistryError> {
        self.store.get(id)
    }

    pub fn query(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>, RegistryError> {
        self.store.query(filter)
    }

    /// Drop a record from the store entirely
    pub fn forget(&self, id: &str) -> Result<bool, RegistryError> {
        self.store.delete(id)
    }
}
