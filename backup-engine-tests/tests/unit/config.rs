//! Unit tests for configuration loading and validation
//!
//! These tests verify config parsing, validation, and job resolution.

use backup_engine::config::{load_config, resolve_all_jobs, resolve_job, ConfigError, DatabaseEngine, RetentionDefaults};
use serial_test::serial;
use test_utils::{BackupKind, ConfigBuilder, Frequency, StorageProvider, TestContext};

#[test]
fn test_config_loading_valid() {
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .add_file_tree_job("home", &["app"])
        .write();

    let loaded = load_config(&config_path);
    assert!(loaded.is_ok(), "Config should load successfully: {:?}", loaded.err());

    let loaded_config = loaded.unwrap();
    assert!(loaded_config.jobs.contains_key("home"));
    assert!(loaded_config.storage.local.is_some());
}

#[test]
fn test_config_invalid_toml() {
    let ctx = TestContext::new();
    let config_path = ctx.create_file("config.toml", "invalid { toml content");

    let result = load_config(&config_path);
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn test_config_missing_file() {
    let result = load_config("/nonexistent/backup-engine/config.toml");
    assert!(matches!(result, Err(ConfigError::ReadError(_))));
}

#[test]
fn test_config_requires_storage() {
    let (config_path, _, _temp_dir) = ConfigBuilder::new().write();

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("No storage providers"));
}

#[test]
fn test_config_job_targets_unconfigured_storage() {
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .add_file_tree_job("home", &["app"])
        .edit_job("home", |job| job.storage = StorageProvider::S3)
        .write();

    let result = load_config(&config_path);
    assert!(matches!(
        result,
        Err(ConfigError::StorageNotConfigured(StorageProvider::S3))
    ));
}

#[test]
fn test_config_encrypt_requires_key_file() {
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .add_file_tree_job("home", &["app"])
        .edit_job("home", |job| job.encrypt = true)
        .write();

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("encryption_key_file"));

    // With a key file the same job is valid
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .with_encryption_key()
        .add_file_tree_job("home", &["app"])
        .edit_job("home", |job| job.encrypt = true)
        .write();
    assert!(load_config(&config_path).is_ok());
}

#[test]
fn test_config_database_job_requires_database_section() {
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .add_job("db-daily", BackupKind::Database)
        .write();

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("[database]"));

    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .with_database(DatabaseEngine::Postgres, "postgres://app@localhost/app")
        .add_job("db-daily", BackupKind::Database)
        .write();
    assert!(load_config(&config_path).is_ok());
}

#[test]
fn test_config_file_tree_job_requires_include() {
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .add_job("home", BackupKind::FileTree)
        .write();

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("include pattern"));
}

#[test]
fn test_config_rejects_bad_job_name() {
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .add_file_tree_job("home/../etc", &["app"])
        .write();

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("Invalid job name"));
}

#[test]
fn test_config_rejects_compression_level() {
    let ctx = TestContext::new();
    let store = ctx.create_subdir("store");
    let config_content = format!(
        r#"
[global]
compression_level = 12

[storage.local]
base_dir = "{}"
"#,
        store.display()
    );
    let config_path = ctx.create_file("config.toml", &config_content);

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("compression_level"));
}

#[test]
fn test_config_defaults_from_minimal_toml() {
    let ctx = TestContext::new();
    let store = ctx.create_subdir("store");
    let config_content = format!(
        r#"
[global]

[storage.local]
base_dir = "{}"

[jobs.configs]
kind = "config_snapshot"
storage = "local"
"#,
        store.display()
    );
    let config_path = ctx.create_file("config.toml", &config_content);

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.global.compression_level, 6);
    assert_eq!(config.retention, RetentionDefaults::default());

    let job = resolve_job("configs", &config).unwrap();
    assert_eq!(job.kind, BackupKind::ConfigSnapshot);
    assert_eq!(job.frequency, Frequency::OnDemand);
    assert!(job.compress);
    assert!(!job.encrypt);
    assert!(job.verify_integrity);
    assert_eq!(job.retention_days, RetentionDefaults::default().on_demand);
}

#[test]
fn test_resolve_retention_precedence() {
    let retention = RetentionDefaults {
        daily: 7,
        ..RetentionDefaults::default()
    };
    let config = ConfigBuilder::minimal()
        .with_retention(retention)
        .add_file_tree_job("defaulted", &["app"])
        .add_file_tree_job("overridden", &["app"])
        .edit_job("overridden", |job| job.retention_days = Some(3))
        .build();

    assert_eq!(resolve_job("defaulted", &config).unwrap().retention_days, 7);
    assert_eq!(resolve_job("overridden", &config).unwrap().retention_days, 3);
}

#[test]
fn test_resolve_all_jobs_skips_disabled() {
    let config = ConfigBuilder::minimal()
        .add_file_tree_job("home", &["app"])
        .add_job("configs", BackupKind::ConfigSnapshot)
        .add_disabled_job("paused")
        .build();

    let jobs = resolve_all_jobs(&config).unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.contains_key("home"));
    assert!(jobs.contains_key("configs"));
    assert!(!jobs.contains_key("paused"));
}

#[test]
fn test_resolve_missing_job() {
    let config = ConfigBuilder::minimal().build();
    assert!(matches!(
        resolve_job("nope", &config),
        Err(ConfigError::JobNotFound(_))
    ));
}

#[test]
fn test_kind_and_frequency_parsing() {
    assert_eq!("file-tree".parse::<BackupKind>().unwrap(), BackupKind::FileTree);
    assert_eq!("DATABASE".parse::<BackupKind>().unwrap(), BackupKind::Database);
    assert_eq!("on_demand".parse::<Frequency>().unwrap(), Frequency::OnDemand);
    assert!("fortnightly".parse::<Frequency>().is_err());
    assert_eq!("gcs".parse::<StorageProvider>().unwrap(), StorageProvider::Gcs);
}

#[test]
#[serial]
fn test_database_url_from_environment() {
    std::env::set_var("BACKUP_ENGINE_TEST_DB_URL", "postgres://app:pw@db.internal/main");
    let (config_path, _, _temp_dir) = ConfigBuilder::minimal()
        .with_database(DatabaseEngine::Postgres, "env:BACKUP_ENGINE_TEST_DB_URL")
        .add_job("db-daily", BackupKind::Database)
        .write();

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.database.unwrap().url, "postgres://app:pw@db.internal/main");

    std::env::remove_var("BACKUP_ENGINE_TEST_DB_URL");
    assert!(matches!(load_config(&config_path), Err(ConfigError::MissingEnv(_))));
}
