//! Configuration module for backup-engine
//!
//! This module handles loading, validating, and resolving configuration from TOML files.
//!
//! ## Configuration Inheritance
//!
//! Settings are applied in this order (later overrides earlier):
//! 1. Global defaults
//! 2. Per-frequency retention defaults
//! 3. Job-level settings
//!
//! ## Example Usage
//!
//! ```no_run
//! use backup_engine::config;
//!
//! let config = config::load_config("backup-engine.toml")?;
//! let jobs = config::resolve_all_jobs(&config)?;
//!
//! for (name, job) in jobs {
//!     println!("Job: {}, Kind: {}, Storage: {}", name, job.kind, job.storage_provider);
//! }
//! # Ok::<(), config::ConfigError>(())
//! ```

mod loader;
mod types;

pub use loader::{
    load_config, parse_config, resolve_all_jobs, resolve_env_value, resolve_job,
    validate_job_name, ConfigError, Result,
};
pub use types::*;

/// Expand tilde (~) in path
pub fn expand_tilde(path: &std::path::Path) -> std::path::PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
