//! Caller-facing engine
//!
//! [`BackupEngine`] owns every collaborator explicitly: nothing is read from
//! process-wide state. Build one from a loaded [`Config`] with
//! [`BackupEngine::from_config`], or assemble one piece by piece with
//! [`EngineBuilder`] (tests, embedding).
//!
//! ```no_run
//! use backup_engine::config;
//! use backup_engine::engine::{BackupEngine, Collaborators};
//! use backup_engine::managers::restore::RestoreMode;
//!
//! let config = config::load_config("backup-engine.toml")?;
//! let engine = BackupEngine::from_config(&config, Collaborators::default())?;
//!
//! let record = engine.run_job("db-daily")?;
//! engine.restore(&record.id, RestoreMode::VerifyOnly)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::{
    self, expand_tilde, BackupConfig, BackupKind, Config, ConfigError, Frequency, RetentionDefaults,
};
use crate::error::{EngineError, Result};
use crate::integrity::IntegrityVerifier;
use crate::managers::backup::BackupOrchestrator;
use crate::managers::notification::{EventReporter, FanoutReporter, LogReporter, WebhookReporter};
use crate::managers::restore::{RestoreMode, RestoreOptions, RestoreOrchestrator, RestoreResult};
use crate::managers::retention::{RetentionManager, SweepResult};
use crate::managers::verify::{IntegrityChecker, VerifyResult};
use crate::managers::Services;
use crate::registry::{BackupRecord, BackupRegistry, JsonFileRegistry, RecordFilter};
use crate::secrets::{KeyFileProvider, NoKeyProvider, SecretProvider};
use crate::storage::{StorageBackend, StorageRegistry};
use crate::strategies::{
    CapturerSet, ConfigSnapshotCapturer, DatabaseCapturer, EngineConfigSource, FileTreeCapturer,
    MediaArchiveCapturer, SourceCapturer, UserDataCapturer, UserDataSink, UserDataSource,
};
use crate::transform::{StandardTransforms, TransformFactory};
use crate::utils::cancel::CancelToken;
use crate::utils::executor::{CommandExecutor, RealExecutor};
use crate::utils::locker::RunLocks;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

fn invalid_config(err: impl std::fmt::Display) -> EngineError {
    EngineError::Config(ConfigError::ValidationError(err.to_string()))
}

/// Platform collaborators that cannot come from the configuration file
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Source of user-data exports; user-data jobs need one
    pub user_data: Option<Arc<dyn UserDataSource>>,
    /// Receiver of user-data imports on restore
    pub user_data_sink: Option<Arc<dyn UserDataSink>>,
    /// Subprocess runner for dump tools; real processes when unset
    pub executor: Option<Arc<dyn CommandExecutor>>,
    /// Extra event reporter, called after logging and webhooks
    pub reporter: Option<Arc<dyn EventReporter>>,
}

/// Piece-by-piece construction of a [`BackupEngine`]
pub struct EngineBuilder {
    work_dir: PathBuf,
    registry: Option<BackupRegistry>,
    storage: StorageRegistry,
    capturers: CapturerSet,
    transforms: Option<Arc<dyn TransformFactory>>,
    secrets: Arc<dyn SecretProvider>,
    compression_level: u32,
    reporter: Arc<dyn EventReporter>,
    locks: RunLocks,
    long_running_threshold: Option<Duration>,
    run_timeout: Option<Duration>,
    jobs: HashMap<String, BackupConfig>,
    retention: RetentionDefaults,
}

impl EngineBuilder {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            registry: None,
            storage: StorageRegistry::new(),
            capturers: CapturerSet::new(),
            transforms: None,
            secrets: Arc::new(NoKeyProvider),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            reporter: Arc::new(LogReporter),
            locks: RunLocks::in_process(),
            long_running_threshold: None,
            run_timeout: None,
            jobs: HashMap::new(),
            retention: RetentionDefaults::default(),
        }
    }

    /// Registry to record runs in; in-memory when unset
    pub fn registry(mut self, registry: BackupRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn storage(mut self, storage: StorageRegistry) -> Self {
        self.storage = storage;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.storage.register(backend);
        self
    }

    pub fn capturer(mut self, capturer: Arc<dyn SourceCapturer>) -> Self {
        self.capturers.register(capturer);
        self
    }

    /// Replace the standard bzip2/AES stages
    pub fn transforms(mut self, factory: Arc<dyn TransformFactory>) -> Self {
        self.transforms = Some(factory);
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn EventReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn locks(mut self, locks: RunLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn long_running_threshold(mut self, threshold: Duration) -> Self {
        self.long_running_threshold = Some(threshold);
        self
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Make a job runnable by name
    pub fn job(mut self, config: BackupConfig) -> Self {
        self.jobs.insert(config.name.clone(), config);
        self
    }

    pub fn retention_defaults(mut self, retention: RetentionDefaults) -> Self {
        self.retention = retention;
        self
    }

    pub fn build(self) -> BackupEngine {
        let transforms: Arc<dyn TransformFactory> = match self.transforms {
            Some(factory) => factory,
            None => Arc::new(StandardTransforms::new(self.compression_level, self.secrets)),
        };

        let services = Services {
            work_dir: self.work_dir,
            registry: self.registry.unwrap_or_else(BackupRegistry::in_memory),
            storage: self.storage,
            capturers: self.capturers,
            transforms,
            verifier: IntegrityVerifier::new(),
            reporter: self.reporter,
            locks: self.locks,
            long_running_threshold: self.long_running_threshold,
            run_timeout: self.run_timeout,
        };

        BackupEngine {
            services: Arc::new(services),
            jobs: self.jobs,
            retention: self.retention,
        }
    }
}

/// Backup, restore, verification and retention over one set of collaborators
pub struct BackupEngine {
    services: Arc<Services>,
    jobs: HashMap<String, BackupConfig>,
    retention: RetentionDefaults,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut jobs: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        jobs.sort_unstable();
        f.debug_struct("BackupEngine")
            .field("work_dir", &self.services.work_dir)
            .field("jobs", &jobs)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl BackupEngine {
    pub fn builder(work_dir: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(work_dir)
    }

    /// Build an engine from a validated configuration
    pub fn from_config(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let global = &config.global;

        let registry_path = expand_tilde(&global.registry_path);
        let registry = JsonFileRegistry::open(&registry_path)?;
        let storage = StorageRegistry::from_config(&config.storage).map_err(invalid_config)?;

        let secrets: Arc<dyn SecretProvider> = match &global.encryption_key_file {
            Some(path) => Arc::new(KeyFileProvider::new(expand_tilde(path))),
            None => Arc::new(NoKeyProvider),
        };

        let source_root = expand_tilde(&global.source_root);
        let mut capturers = CapturerSet::new()
            .with(Arc::new(FileTreeCapturer::new(&source_root)))
            .with(Arc::new(MediaArchiveCapturer::new(&source_root)))
            .with(Arc::new(ConfigSnapshotCapturer::new(Arc::new(EngineConfigSource::new(
                config.clone(),
            )))));
        if let Some(database) = &config.database {
            let executor = collaborators
                .executor
                .clone()
                .unwrap_or_else(|| Arc::new(RealExecutor::new()));
            capturers.register(Arc::new(DatabaseCapturer::new(database.clone(), executor)));
        }
        if let Some(source) = &collaborators.user_data {
            let mut capturer = UserDataCapturer::new(source.clone());
            if let Some(sink) = &collaborators.user_data_sink {
                capturer = capturer.with_sink(sink.clone());
            }
            capturers.register(Arc::new(capturer));
        }

        let mut reporter = FanoutReporter::new().with(Arc::new(LogReporter));
        if !config.notifications.webhook_url.is_empty() {
            let webhook = WebhookReporter::new(config.notifications.clone()).map_err(invalid_config)?;
            reporter = reporter.with(Arc::new(webhook));
        }
        if let Some(extra) = collaborators.reporter {
            reporter = reporter.with(extra);
        }

        let jobs = config::resolve_all_jobs(config)?;
        info!("Engine configured with {} job(s)", jobs.len());

        let mut builder = EngineBuilder::new(expand_tilde(&global.work_dir))
            .registry(BackupRegistry::new(Arc::new(registry)))
            .storage(storage)
            .secrets(secrets)
            .compression_level(global.compression_level)
            .reporter(Arc::new(reporter))
            .locks(RunLocks::new(global.lock_dir.as_deref().map(expand_tilde)))
            .retention_defaults(config.retention.clone());
        builder.capturers = capturers;
        if global.long_running_threshold_minutes > 0 {
            builder = builder.long_running_threshold(Duration::from_secs(global.long_running_threshold_minutes * 60));
        }
        if global.default_timeout_seconds > 0 {
            builder = builder.run_timeout(Duration::from_secs(global.default_timeout_seconds));
        }
        for job in jobs.into_values() {
            builder = builder.job(job);
        }

        Ok(builder.build())
    }

    pub fn registry(&self) -> &BackupRegistry {
        &self.services.registry
    }

    /// Configured job by name
    pub fn job(&self, name: &str) -> Result<&BackupConfig> {
        self.jobs
            .get(name)
            .ok_or_else(|| EngineError::Config(ConfigError::JobNotFound(name.to_string())))
    }

    /// Names of the configured jobs, sorted
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_backup(&self, config: &BackupConfig) -> Result<BackupRecord> {
        self.create_backup_with(config, &CancelToken::new())
    }

    pub fn create_backup_with(&self, config: &BackupConfig, cancel: &CancelToken) -> Result<BackupRecord> {
        BackupOrchestrator::new(self.services.clone()).run(config, cancel)
    }

    /// Back up a configured job
    pub fn run_job(&self, name: &str) -> Result<BackupRecord> {
        let config = self.job(name)?.clone();
        self.create_backup(&config)
    }

    /// Back up every configured job in name order.
    ///
    /// One job failing never stops the others; each outcome is returned.
    pub fn backup_all(&self, cancel: &CancelToken) -> Vec<(String, Result<BackupRecord>)> {
        let mut outcomes = Vec::new();
        for name in self.job_names() {
            if let Err(reason) = cancel.check() {
                outcomes.push((name, Err(reason.into())));
                continue;
            }
            let outcome = match self.jobs.get(&name) {
                Some(config) => self.create_backup_with(config, cancel),
                None => Err(EngineError::Config(ConfigError::JobNotFound(name.clone()))),
            };
            if let Err(e) = &outcome {
                error!("Job '{}' failed: {}", name, e);
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    pub fn restore(&self, id: &str, mode: RestoreMode) -> Result<RestoreResult> {
        let options = RestoreOptions {
            mode,
            ..RestoreOptions::default()
        };
        self.restore_with(id, &options, &CancelToken::new())
    }

    pub fn restore_with(&self, id: &str, options: &RestoreOptions, cancel: &CancelToken) -> Result<RestoreResult> {
        RestoreOrchestrator::new(self.services.clone()).run(id, options, cancel)
    }

    pub fn sweep(&self, kind: BackupKind, frequency: Frequency, retention_days: u32) -> Result<SweepResult> {
        self.sweep_with(kind, frequency, retention_days, &CancelToken::new())
    }

    pub fn sweep_with(
        &self,
        kind: BackupKind,
        frequency: Frequency,
        retention_days: u32,
        cancel: &CancelToken,
    ) -> Result<SweepResult> {
        self.retention().sweep(kind, frequency, retention_days, cancel)
    }

    /// Retention days for `frequency` from the `[retention]` section
    pub fn default_retention_days(&self, frequency: Frequency) -> u32 {
        self.retention.days_for(frequency)
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.services.clone())
    }

    pub fn verify_integrity(&self, id: &str) -> Result<VerifyResult> {
        self.verify_integrity_with(id, &CancelToken::new())
    }

    pub fn verify_integrity_with(&self, id: &str, cancel: &CancelToken) -> Result<VerifyResult> {
        IntegrityChecker::new(self.services.clone()).verify(id, cancel)
    }

    /// Records matching `filter`, oldest first
    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        Ok(self.services.registry.query(filter)?)
    }

    pub fn get(&self, id: &str) -> Result<BackupRecord> {
        Ok(self.services.registry.get(id)?)
    }

    /// Delete a backup's artifact and mark it deleted, whatever its age
    pub fn purge(&self, id: &str) -> Result<BackupRecord> {
        self.retention().purge(id, &CancelToken::new())
    }

    /// Drop the registry entry of a deleted or failed backup
    pub fn forget(&self, id: &str) -> Result<BackupRecord> {
        self.retention().forget(id)
    }
}
