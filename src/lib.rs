//! Backup Engine Library
//!
//! Captures point-in-time artifacts (database dumps, file trees, configuration
//! snapshots, user-data exports, media), compresses and encrypts them, stores
//! them on local disk or object storage, verifies their integrity, enforces
//! retention and reverses the whole pipeline on restore.

pub mod config;
pub mod engine;
pub mod error;
pub mod integrity;
pub mod managers;
pub mod registry;
pub mod secrets;
pub mod storage;
pub mod strategies;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub use config::{load_config, resolve_all_jobs, resolve_job, BackupConfig, BackupKind, Config, Frequency, StorageProvider};
pub use engine::{BackupEngine, Collaborators, EngineBuilder};
pub use error::EngineError;
pub use managers::logging::{init_console_logging, init_logging, LogGuard, LoggingConfig};
pub use managers::notification::{BackupEvent, EventKind, EventReporter};
pub use managers::restore::{RestoreMode, RestoreOptions, RestoreResult};
pub use managers::retention::SweepResult;
pub use managers::verify::VerifyResult;
pub use registry::{BackupRecord, BackupStatus, RecordFilter};
pub use utils::cancel::CancelToken;
