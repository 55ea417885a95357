//! Registry persisted as a JSON document on disk
//!
//! Every mutation takes an exclusive `fd-lock` on a sibling `.lock` file,
//! re-reads the document, applies the change and replaces the file through a
//! temp file and rename. Readers take a shared lock. Several processes can
//! therefore share one registry file without losing updates.

use super::{
    insert_record, query_records, update_record, BackupRecord, RecordFilter, RecordUpdate,
    RegistryError, RegistryStore,
};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    records: Vec<BackupRecord>,
}

pub struct JsonFileRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    /// Serializes threads of this process before they contend on the file lock
    local: Mutex<()>,
}

impl JsonFileRegistry {
    /// Registry stored at `path`; parent directories are created as needed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        Ok(Self {
            path,
            lock_path,
            local: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<RwLock<File>, RegistryError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| self.io(&self.lock_path, source))?;
        Ok(RwLock::new(file))
    }

    fn io(&self, path: &Path, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn load(&self) -> Result<BTreeMap<String, BackupRecord>, RegistryError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }

        let document: RegistryDocument =
            serde_json::from_slice(&bytes).map_err(|e| RegistryError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        if document.version != FORMAT_VERSION {
            return Err(RegistryError::Corrupt {
                path: self.path.clone(),
                message: format!("unsupported format version {}", document.version),
            });
        }

        Ok(document
            .records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect())
    }

    fn save(&self, records: &BTreeMap<String, BackupRecord>) -> Result<(), RegistryError> {
        let document = RegistryDocument {
            version: FORMAT_VERSION,
            records: records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document).map_err(|e| RegistryError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io(dir, e))?;
        temp.write_all(&bytes)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| self.io(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| self.io(&self.path, e.error))?;

        debug!("Saved registry with {} records to {:?}", records.len(), self.path);
        Ok(())
    }

    /// Run `f` over the records under the exclusive lock, then save them
    fn mutate<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut BTreeMap<String, BackupRecord>) -> Result<T, RegistryError>,
    {
        let _local = self.local.lock().unwrap_or_else(|p| p.into_inner());
        let mut lock = self.lock_file()?;
        let _guard = lock.write().map_err(|e| self.io(&self.lock_path, e))?;

        let mut records = self.load()?;
        let value = f(&mut records)?;
        self.save(&records)?;
        Ok(value)
    }

    fn read<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&BTreeMap<String, BackupRecord>) -> T,
    {
        let _local = self.local.lock().unwrap_or_else(|p| p.into_inner());
        let lock = self.lock_file()?;
        let _guard = lock.read().map_err(|e| self.io(&self.lock_path, e))?;
        Ok(f(&self.load()?))
    }
}

impl RegistryStore for JsonFileRegistry {
    fn create(&self, record: BackupRecord) -> Result<(), RegistryError> {
        self.mutate(|records| insert_record(records, record))
    }

    fn update_by_id(&self, id: &str, update: RecordUpdate<'_>) -> Result<BackupRecord, RegistryError> {
        self.mutate(|records| update_record(records, id, update))
    }

    fn get(&self, id: &str) -> Result<Option<BackupRecord>, RegistryError> {
        self.read(|records| records.get(id).cloned())
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>, RegistryError> {
        self.read(|records| query_records(records, filter))
    }

    fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        self.mutate(|records| Ok(records.remove(id).is_some()))
    }
}
