//! Mock collaborators for pipeline tests
//!
//! Each mock injects one kind of failure or observation point into the
//! engine: recorded events, failing storage operations, failing capture or
//! transform stages, and a capturer that blocks until released.

use backup_engine::config::{BackupConfig, BackupKind, StorageProvider};
use backup_engine::managers::notification::{BackupEvent, EventKind, EventReporter, NotifyError};
use backup_engine::storage::{LocalBackend, StorageBackend, StorageError};
use backup_engine::strategies::{
    ApplyError, CaptureError, CapturedArtifact, RestoreTarget, SourceCapturer, UserDataSink,
    UserDataSource,
};
use backup_engine::transform::{StageKind, TransformError, TransformFactory, TransformStage};
use backup_engine::utils::cancel::CancelToken;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Collects every reported event
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<BackupEvent>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventReporter for RecordingReporter {
    fn report(&self, event: &BackupEvent) -> Result<(), NotifyError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Storage failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Unavailable,
    NotFound,
    Rejected,
}

impl Failure {
    fn error(self, uri: &str) -> StorageError {
        match self {
            Failure::Unavailable => StorageError::Unavailable {
                provider: StorageProvider::Local,
                message: "injected outage".to_string(),
            },
            Failure::NotFound => StorageError::NotFound(uri.to_string()),
            Failure::Rejected => StorageError::Rejected {
                provider: StorageProvider::Local,
                status: 403,
                message: "injected rejection".to_string(),
            },
        }
    }
}

/// Local storage with injectable failures.
///
/// In remote mode it hides `local_path`, so the engine downloads artifacts
/// through `get` the way it does for object stores.
pub struct FlakyBackend {
    inner: LocalBackend,
    remote: bool,
    put_failure: Mutex<Option<Failure>>,
    get_failure: Mutex<Option<Failure>>,
    delete_failures: Mutex<HashMap<String, Failure>>,
    calls: Mutex<Vec<String>>,
}

impl FlakyBackend {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            inner: LocalBackend::new(base_dir).expect("Failed to create local backend"),
            remote: false,
            put_failure: Mutex::new(None),
            get_failure: Mutex::new(None),
            delete_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Behave like an object store: always download through `get`
    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub fn fail_put(&self, failure: Failure) {
        *self.put_failure.lock() = Some(failure);
    }

    pub fn fail_get(&self, failure: Failure) {
        *self.get_failure.lock() = Some(failure);
    }

    /// Fail deletes of one artifact
    pub fn fail_delete(&self, uri: &str, failure: Failure) {
        self.delete_failures.lock().insert(uri.to_string(), failure);
    }

    pub fn heal(&self) {
        *self.put_failure.lock() = None;
        *self.get_failure.lock() = None;
        self.delete_failures.lock().clear();
    }

    /// Operations in call order, e.g. `put:<key>` or `delete:<uri>`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &str, target: &str) {
        self.calls.lock().push(format!("{}:{}", op, target));
    }
}

impl StorageBackend for FlakyBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Local
    }

    fn put(&self, key: &str, local_path: &Path, cancel: &CancelToken) -> Result<String, StorageError> {
        self.record("put", key);
        if let Some(failure) = *self.put_failure.lock() {
            return Err(failure.error(key));
        }
        self.inner.put(key, local_path, cancel)
    }

    fn get(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<(), StorageError> {
        self.record("get", uri);
        if let Some(failure) = *self.get_failure.lock() {
            return Err(failure.error(uri));
        }
        self.inner.get(uri, dest, cancel)
    }

    fn delete(&self, uri: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        self.record("delete", uri);
        if let Some(failure) = self.delete_failures.lock().get(uri).copied() {
            return Err(failure.error(uri));
        }
        self.inner.delete(uri, cancel)
    }

    fn exists(&self, uri: &str, cancel: &CancelToken) -> Result<bool, StorageError> {
        self.inner.exists(uri, cancel)
    }

    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix, cancel)
    }

    fn local_path(&self, uri: &str) -> Option<PathBuf> {
        if self.remote {
            None
        } else {
            self.inner.local_path(uri)
        }
    }
}

/// Capturer that writes a partial file into the work directory and fails
pub struct FailingCapturer {
    kind: BackupKind,
}

impl FailingCapturer {
    pub fn new(kind: BackupKind) -> Self {
        Self { kind }
    }
}

impl SourceCapturer for FailingCapturer {
    fn kind(&self) -> BackupKind {
        self.kind
    }

    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        _cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError> {
        let partial = work_dir.join(format!("{}.partial", config.name));
        fs::write(&partial, b"half a dump").map_err(|source| CaptureError::Io {
            path: partial.clone(),
            source,
        })?;
        Err(CaptureError::Source("source went away mid-capture".to_string()))
    }

    fn restore(
        &self,
        _artifact: &Path,
        _target: &RestoreTarget,
        _work_dir: &Path,
        _cancel: &CancelToken,
    ) -> Result<(), ApplyError> {
        Err(ApplyError::Target("restore not supported".to_string()))
    }
}

#[derive(Default)]
struct GateState {
    entered: usize,
    open: bool,
}

/// Wraps a capturer and holds every capture until the gate is opened
#[derive(Clone)]
pub struct GatedCapturer {
    inner: Arc<dyn SourceCapturer>,
    gate: Arc<(Mutex<GateState>, Condvar)>,
}

impl GatedCapturer {
    pub fn new(inner: Arc<dyn SourceCapturer>) -> Self {
        Self {
            inner,
            gate: Arc::new((Mutex::new(GateState::default()), Condvar::new())),
        }
    }

    /// Block until `count` captures are waiting at the gate
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let (state, condvar) = &*self.gate;
        let deadline = Instant::now() + timeout;
        let mut state = state.lock();
        while state.entered < count {
            if condvar.wait_until(&mut state, deadline).timed_out() {
                return state.entered >= count;
            }
        }
        true
    }

    pub fn open(&self) {
        let (state, condvar) = &*self.gate;
        state.lock().open = true;
        condvar.notify_all();
    }
}

impl SourceCapturer for GatedCapturer {
    fn kind(&self) -> BackupKind {
        self.inner.kind()
    }

    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError> {
        {
            let (state, condvar) = &*self.gate;
            let mut state = state.lock();
            state.entered += 1;
            condvar.notify_all();
            while !state.open {
                condvar.wait_for(&mut state, Duration::from_millis(50));
                cancel.check()?;
            }
        }
        self.inner.capture(config, work_dir, cancel)
    }

    fn restore(
        &self,
        artifact: &Path,
        target: &RestoreTarget,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ApplyError> {
        self.inner.restore(artifact, target, work_dir, cancel)
    }
}

/// Stage that leaves a partial output behind and fails
struct FailingStage {
    kind: StageKind,
}

impl TransformStage for FailingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn algorithm(&self) -> &'static str {
        "failing"
    }

    fn extension(&self) -> &'static str {
        match self.kind {
            StageKind::Compress => "bz2",
            StageKind::Encrypt => "enc",
        }
    }

    fn apply(&self, input: &Path, out_dir: &Path, _cancel: &CancelToken) -> Result<PathBuf, TransformError> {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let partial = out_dir.join(format!("{}.{}", name, self.extension()));
        fs::write(&partial, b"partial").map_err(|source| TransformError::Io {
            stage: "failing",
            path: partial.clone(),
            source,
        })?;
        Err(TransformError::Encryption(format!("injected {} failure", self.kind)))
    }

    fn invert(&self, _input: &Path, _out_dir: &Path, _cancel: &CancelToken) -> Result<PathBuf, TransformError> {
        Err(TransformError::Decryption("injected inverse failure".to_string()))
    }
}

/// Factory whose chosen stage always fails; the other stage is real
pub struct FailingTransforms {
    inner: Arc<dyn TransformFactory>,
    failing: StageKind,
}

impl FailingTransforms {
    pub fn new(inner: Arc<dyn TransformFactory>, failing: StageKind) -> Self {
        Self { inner, failing }
    }
}

impl TransformFactory for FailingTransforms {
    fn compressor(&self) -> Result<Box<dyn TransformStage>, TransformError> {
        match self.failing {
            StageKind::Compress => Ok(Box::new(FailingStage {
                kind: StageKind::Compress,
            })),
            StageKind::Encrypt => self.inner.compressor(),
        }
    }

    fn encryptor(&self) -> Result<Box<dyn TransformStage>, TransformError> {
        match self.failing {
            StageKind::Encrypt => Ok(Box::new(FailingStage {
                kind: StageKind::Encrypt,
            })),
            StageKind::Compress => self.inner.encryptor(),
        }
    }
}

/// In-memory user data store acting as both source and sink
#[derive(Clone, Default)]
pub struct MemoryUserData {
    collections: Arc<Mutex<BTreeMap<String, Vec<Value>>>>,
}

impl MemoryUserData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, name: &str, records: Vec<Value>) -> Self {
        self.collections.lock().insert(name.to_string(), records);
        self
    }

    pub fn set(&self, name: &str, records: Vec<Value>) {
        self.collections.lock().insert(name.to_string(), records);
    }

    pub fn get(&self, name: &str) -> Vec<Value> {
        self.collections.lock().get(name).cloned().unwrap_or_default()
    }
}

impl UserDataSource for MemoryUserData {
    fn collections(&self) -> Vec<String> {
        self.collections.lock().keys().cloned().collect()
    }

    fn export(&self, collection: &str) -> Result<Vec<Value>, String> {
        self.collections
            .lock()
            .get(collection)
            .cloned()
            .ok_or_else(|| format!("unknown collection '{}'", collection))
    }
}

impl UserDataSink for MemoryUserData {
    fn import(&self, collection: &str, records: Vec<Value>) -> Result<(), String> {
        self.collections.lock().insert(collection.to_string(), records);
        Ok(())
    }
}
