//! Per-job run locks to prevent overlapping runs of the same logical job

use fd_lock::RwLock;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("job '{0}' is already running")]
    Held(String),

    #[error("failed to open lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Advisory locks keyed by job name.
///
/// Within a process, a name is claimed in a shared set. When a lock directory
/// is configured the claim is also backed by an exclusive file lock, so runs
/// in different processes sharing the registry exclude each other too.
/// Contention never waits: the caller gets `LockError::Held` immediately.
pub struct RunLocks {
    active: Mutex<HashSet<String>>,
    lock_dir: Option<PathBuf>,
}

impl RunLocks {
    pub fn new(lock_dir: Option<PathBuf>) -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
            lock_dir,
        }
    }

    /// Locks that only exclude runs inside this process
    pub fn in_process() -> Self {
        Self::new(None)
    }

    /// Run `f` while holding the lock for `name`
    pub fn with_lock<T, E, F>(&self, name: &str, f: F) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce() -> Result<T, E>,
    {
        let _slot = self.claim(name)?;

        let Some(dir) = self.lock_dir.as_deref() else {
            return f();
        };

        let path = lock_path(dir, name);
        let file = fs::create_dir_all(dir)
            .and_then(|_| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
            })
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        let mut lock = RwLock::new(file);
        let _guard = match lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockError::Held(name.to_string()).into());
            }
            Err(source) => return Err(LockError::Io { path, source }.into()),
        };

        info!("Acquired run lock for job: {}", name);
        let result = f();
        debug!("Releasing run lock for job: {}", name);
        result
    }

    /// Whether a run of `name` is in progress in this process
    pub fn is_held(&self, name: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }

    fn claim(&self, name: &str) -> Result<Slot<'_>, LockError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !active.insert(name.to_string()) {
            return Err(LockError::Held(name.to_string()));
        }

        Ok(Slot {
            locks: self,
            name: name.to_string(),
        })
    }
}

/// In-process claim, released on drop
struct Slot<'a> {
    locks: &'a RunLocks,
    name: String,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.locks
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
    }
}

fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("backup-engine-{}.lock", name))
}
