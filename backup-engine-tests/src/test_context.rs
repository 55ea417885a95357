//! Test context and harness for pipeline testing
//!
//! Provides a unified context for setting up and tearing down test environments:
//! a source tree, a local store, a work directory and an engine wired to them.

use crate::fixtures::test_key;
use crate::mocks::{FlakyBackend, RecordingReporter};
use anyhow::Result;
use backup_engine::engine::{BackupEngine, EngineBuilder};
use backup_engine::registry::BackupRegistry;
use backup_engine::secrets::StaticKeyProvider;
use backup_engine::strategies::{FileTreeCapturer, MediaArchiveCapturer};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Test context that manages test resources and provides common utilities
pub struct TestContext {
    /// Temporary directory for test files
    temp_dir: TempDir,
    reporter: RecordingReporter,
    backend: Arc<FlakyBackend>,
    /// Shared by every engine built from this context
    registry: BackupRegistry,
}

impl TestContext {
    /// Create a new test context with empty source, store and work directories
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(temp_dir.path().join("source")).expect("Failed to create source dir");
        let backend = Arc::new(FlakyBackend::new(&temp_dir.path().join("store")));

        Self {
            temp_dir,
            reporter: RecordingReporter::new(),
            backend,
            registry: BackupRegistry::in_memory(),
        }
    }

    /// Context whose backend is downloaded from instead of read in place
    pub fn remote() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(temp_dir.path().join("source")).expect("Failed to create source dir");
        let backend = Arc::new(FlakyBackend::new(&temp_dir.path().join("store")).remote());

        Self {
            temp_dir,
            reporter: RecordingReporter::new(),
            backend,
            registry: BackupRegistry::in_memory(),
        }
    }

    /// Get the temporary directory path
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn source_dir(&self) -> PathBuf {
        self.temp_dir.path().join("source")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.temp_dir.path().join("store")
    }

    /// Parent of the per-run workspaces
    pub fn work_dir(&self) -> PathBuf {
        self.temp_dir.path().join("work")
    }

    pub fn reporter(&self) -> &RecordingReporter {
        &self.reporter
    }

    pub fn backend(&self) -> &Arc<FlakyBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &BackupRegistry {
        &self.registry
    }

    /// Engine builder wired to this context: shared registry, local store,
    /// file tree and media capturers over the source directory, a fixed
    /// encryption key
    pub fn engine_builder(&self) -> EngineBuilder {
        let source = self.source_dir();
        BackupEngine::builder(self.work_dir())
            .registry(self.registry.clone())
            .backend(self.backend.clone())
            .capturer(Arc::new(FileTreeCapturer::new(&source)))
            .capturer(Arc::new(MediaArchiveCapturer::new(&source)))
            .secrets(Arc::new(StaticKeyProvider::new(test_key())))
            .reporter(Arc::new(self.reporter.clone()))
    }

    pub fn engine(&self) -> BackupEngine {
        self.engine_builder().build()
    }

    /// Entries left anywhere under the work directory
    pub fn work_dir_entries(&self) -> usize {
        count_entries(&self.work_dir())
    }

    /// Files in the store, relative paths, sorted
    pub fn stored_files(&self) -> Vec<PathBuf> {
        let store = self.store_dir();
        let mut files = Vec::new();
        collect_files(&store, &store, &mut files);
        files.sort();
        files
    }

    /// Create a subdirectory in the temp dir
    pub fn create_subdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::create_dir_all(&path).expect("Failed to create subdirectory");
        path
    }

    /// Create a file in the temp directory with the given content
    pub fn create_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Create a file in the source directory
    pub fn create_source_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.source_dir().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Read a file from the temp directory
    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.temp_dir.path().join(name))?)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

fn count_entries(dir: &Path) -> usize {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| {
                let path = e.path();
                if path.is_dir() {
                    1 + count_entries(&path)
                } else {
                    1
                }
            })
            .sum(),
        Err(_) => 0,
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
}

/// Extension trait for assertion helpers
pub trait ResultAssertions<T> {
    /// Assert that the result is Ok and return the value
    fn assert_ok(self) -> T;

    /// Assert that the result is Ok with a custom message
    fn assert_ok_msg(self, msg: &str) -> T;

    /// Assert that the result is Err
    fn assert_err(self);

    /// Assert that the result is Err and the error message contains the given string
    fn assert_err_contains(self, needle: &str);
}

impl<T: std::fmt::Debug, E: std::fmt::Debug + std::fmt::Display> ResultAssertions<T> for Result<T, E> {
    fn assert_ok(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    }

    fn assert_ok_msg(self, msg: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("{}: {:?}", msg, e),
        }
    }

    fn assert_err(self) {
        if let Ok(v) = self {
            panic!("Expected Err, got Ok: {:?}", v);
        }
    }

    fn assert_err_contains(self, needle: &str) {
        match self {
            Ok(v) => panic!("Expected Err containing '{}', got Ok: {:?}", needle, v),
            Err(e) => {
                let err_msg = e.to_string();
                assert!(
                    err_msg.contains(needle),
                    "Expected error containing '{}', got: {}",
                    needle,
                    err_msg
                );
            }
        }
    }
}
