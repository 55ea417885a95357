//! Fluent API for building test configurations
//!
//! Provides a builder pattern for creating test configurations with sensible defaults.
//! Every path points into a temporary directory owned by the builder.

use backup_engine::config::{
    BackupKind, Config, DatabaseConfig, DatabaseEngine, Frequency, GlobalConfig, JobConfig,
    LocalStorageConfig, LogFormat, NotificationConfig, RetentionDefaults, StorageConfig, StorageProvider,
};
use backup_engine::secrets::EncryptionKey;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Builder for creating test configurations
pub struct ConfigBuilder {
    temp_dir: TempDir,
    global: GlobalConfig,
    retention: RetentionDefaults,
    storage: StorageConfig,
    database: Option<DatabaseConfig>,
    notifications: NotificationConfig,
    jobs: HashMap<String, JobConfig>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder with minimal defaults and no storage
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let source_root = temp_dir.path().join("source");
        fs::create_dir_all(&source_root).expect("Failed to create source root");

        let log_directory = temp_dir.path().join("logs");
        fs::create_dir_all(&log_directory).expect("Failed to create log_directory");

        let global = GlobalConfig {
            work_dir: temp_dir.path().join("work"),
            lock_dir: None,
            registry_path: temp_dir.path().join("registry.json"),
            encryption_key_file: None,
            source_root,
            default_timeout_seconds: 300,
            long_running_threshold_minutes: 30,
            compression_level: 6,
            log_directory,
            log_level: "info".to_string(),
            log_max_files: 5,
            log_format: LogFormat::Text,
        };

        Self {
            temp_dir,
            global,
            retention: RetentionDefaults::default(),
            storage: StorageConfig::default(),
            database: None,
            notifications: NotificationConfig::default(),
            jobs: HashMap::new(),
        }
    }

    /// Create a minimal config with local storage and no jobs
    pub fn minimal() -> Self {
        let builder = Self::new();
        let store = builder.temp_dir.path().join("store");
        builder.with_local_storage(&store)
    }

    /// Store artifacts under `path`
    pub fn with_local_storage(mut self, path: &Path) -> Self {
        fs::create_dir_all(path).expect("Failed to create storage dir");
        self.storage.local = Some(LocalStorageConfig {
            base_dir: path.to_path_buf(),
        });
        self
    }

    /// Write a fresh key file and point the config at it
    pub fn with_encryption_key(mut self) -> Self {
        let path = self.temp_dir.path().join("backup.key");
        let key = EncryptionKey::generate();
        fs::write(&path, key.to_base64().as_bytes()).expect("Failed to write key file");
        self.global.encryption_key_file = Some(path);
        self
    }

    /// Use cross-process lock files
    pub fn with_lock_dir(mut self) -> Self {
        self.global.lock_dir = Some(self.temp_dir.path().join("locks"));
        self
    }

    /// Set the default timeout
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.global.default_timeout_seconds = seconds;
        self
    }

    /// Set the per-frequency retention defaults
    pub fn with_retention(mut self, retention: RetentionDefaults) -> Self {
        self.retention = retention;
        self
    }

    /// Add a `[database]` section
    pub fn with_database(mut self, engine: DatabaseEngine, url: &str) -> Self {
        self.database = Some(DatabaseConfig {
            engine,
            url: url.to_string(),
            dump_timeout_seconds: 60,
            extra_dump_args: vec![],
        });
        self
    }

    /// Set notification configuration
    pub fn with_notifications(mut self, config: NotificationConfig) -> Self {
        self.notifications = config;
        self
    }

    /// Add a job stored locally, compressed and verified
    pub fn add_job(self, name: &str, kind: BackupKind) -> Self {
        let job = JobConfig {
            enabled: true,
            kind,
            frequency: Frequency::Daily,
            storage: StorageProvider::Local,
            compress: true,
            encrypt: false,
            verify_integrity: true,
            retention_days: None,
            include: vec![],
            exclude: vec![],
            metadata: BTreeMap::new(),
        };
        self.add_job_config(name, job)
    }

    /// Add a file tree job over `include`, relative to the source root
    pub fn add_file_tree_job(self, name: &str, include: &[&str]) -> Self {
        let mut builder = self.add_job(name, BackupKind::FileTree);
        if let Some(job) = builder.jobs.get_mut(name) {
            job.include = include.iter().map(|s| s.to_string()).collect();
        }
        builder
    }

    /// Add a disabled file tree job
    pub fn add_disabled_job(self, name: &str) -> Self {
        let mut builder = self.add_file_tree_job(name, &["."]);
        if let Some(job) = builder.jobs.get_mut(name) {
            job.enabled = false;
        }
        builder
    }

    /// Add a job with full configuration
    pub fn add_job_config(mut self, name: &str, job: JobConfig) -> Self {
        self.jobs.insert(name.to_string(), job);
        self
    }

    /// Modify an already added job
    pub fn edit_job<F: FnOnce(&mut JobConfig)>(mut self, name: &str, edit: F) -> Self {
        if let Some(job) = self.jobs.get_mut(name) {
            edit(job);
        }
        self
    }

    /// Get the temp directory path
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Directory relative include patterns are resolved against
    pub fn source_root(&self) -> &Path {
        &self.global.source_root
    }

    /// Local storage directory, if configured
    pub fn store_dir(&self) -> Option<PathBuf> {
        self.storage.local.as_ref().map(|l| l.base_dir.clone())
    }

    /// Build the Config
    pub fn build(self) -> Config {
        self.persist().0
    }

    /// Keep the temp directory (don't delete on drop)
    pub fn persist(self) -> (Config, TempDir) {
        let config = Config {
            global: self.global,
            retention: self.retention,
            storage: self.storage,
            database: self.database,
            notifications: self.notifications,
            jobs: self.jobs,
        };
        (config, self.temp_dir)
    }

    /// Write the config as TOML into its temp directory and return the path
    pub fn write(self) -> (PathBuf, Config, TempDir) {
        let (config, temp_dir) = self.persist();
        let path = temp_dir.path().join("config.toml");
        let toml_str = toml::to_string_pretty(&config).expect("Failed to serialize config");
        fs::write(&path, toml_str).expect("Failed to write config file");
        (path, config, temp_dir)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
