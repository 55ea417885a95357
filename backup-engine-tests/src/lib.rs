//! Test utilities for backup-engine
//!
//! This crate provides shared test utilities, mock collaborators,
//! and helper functions for testing the backup engine.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use test_utils::{ConfigBuilder, TestContext};
//!
//! #[test]
//! fn my_test() {
//!     let ctx = TestContext::new();
//!     sample_tree(&ctx.source_dir());
//!     let engine = ctx.engine();
//!     // ... test code
//! }
//! ```

pub mod config_builder;
pub mod fixtures;
pub mod mocks;
pub mod test_context;

// Re-export commonly used items
pub use config_builder::ConfigBuilder;
pub use fixtures::*;
pub use mocks::{
    FailingCapturer, FailingTransforms, Failure, FlakyBackend, GatedCapturer, MemoryUserData,
    RecordingReporter,
};
pub use test_context::{ResultAssertions, TestContext};

// Re-export types from the main crate for convenience
pub use backup_engine::config::{
    BackupConfig, BackupKind, Config, Frequency, GlobalConfig, JobConfig, StorageProvider,
};
pub use backup_engine::registry::{BackupRecord, BackupRegistry, BackupStatus, RecordFilter};

// Re-export mock implementations from the main crate
pub use backup_engine::utils::executor::mock::{MockExecutor, MockResponse};
pub use backup_engine::utils::executor::CommandExecutor;

/// Common test result type
pub type TestResult<T = ()> = anyhow::Result<T>;
