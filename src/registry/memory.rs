use super::{
    insert_record, query_records, update_record, BackupRecord, RecordFilter, RecordUpdate,
    RegistryError, RegistryStore,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Registry held in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    records: Mutex<BTreeMap<String, BackupRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, BackupRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RegistryStore for InMemoryRegistry {
    fn create(&self, record: BackupRecord) -> Result<(), RegistryError> {
        insert_record(&mut self.records(), record)
    }

    fn update_by_id(&self, id: &str, update: RecordUpdate<'_>) -> Result<BackupRecord, RegistryError> {
        update_record(&mut self.records(), id, update)
    }

    fn get(&self, id: &str) -> Result<Option<BackupRecord>, RegistryError> {
        Ok(self.records().get(id).cloned())
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>, RegistryError> {
        Ok(query_records(&self.records(), filter))
    }

    fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        Ok(self.records().remove(id).is_some())
    }
}
