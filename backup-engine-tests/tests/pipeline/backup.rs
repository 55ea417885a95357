//! Tests for creating backups
//!
//! A backup captures, transforms, stores and verifies one artifact and leaves
//! a settled record behind.

use backup_engine::error::EngineError;
use backup_engine::integrity::IntegrityVerifier;
use backup_engine::managers::notification::EventKind;
use backup_engine::registry::keys;
use backup_engine::utils::cancel::CancelToken;
use std::path::PathBuf;
use test_utils::{
    file_tree_job, sample_tree, BackupKind, BackupStatus, Failure, RecordFilter, ResultAssertions,
    StorageProvider, TestContext,
};

#[test]
fn test_file_tree_backup_is_verified() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let record = engine.create_backup(&file_tree_job("home", &["app"])).assert_ok();

    assert_eq!(record.status, BackupStatus::Verified);
    assert!(record.verified_at.is_some());
    assert!(record.id.starts_with("home-"));
    assert_eq!(record.kind, BackupKind::FileTree);
    assert_eq!(record.storage_provider, StorageProvider::Local);

    let stored = PathBuf::from(record.location_uri.clone().unwrap());
    assert!(stored.is_file());
    assert_eq!(record.size_bytes, std::fs::metadata(&stored).unwrap().len());
    let actual = IntegrityVerifier::new().checksum(&stored, &CancelToken::new()).unwrap();
    assert_eq!(record.checksum.as_deref(), Some(actual.as_str()));

    assert_eq!(ctx.work_dir_entries(), 0, "run workspace should be removed");
    assert_eq!(ctx.reporter().count(EventKind::BackupCompleted), 1);
}

#[test]
fn test_backup_records_engine_metadata() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let record = engine.create_backup(&file_tree_job("home", &["app"])).assert_ok();

    assert_eq!(record.job_name(), Some("home"));
    assert_eq!(record.transforms(), "compress");
    assert_eq!(record.meta(keys::COMPRESSION), Some("bzip2"));
    assert_eq!(record.meta(keys::ENCRYPTION), None);
    assert_eq!(record.meta(keys::ARTIFACT_NAME), Some("home.zip"));
    assert_eq!(record.meta("entry_count"), Some("3"));

    let raw = record.raw_checksum().unwrap();
    assert!(raw.starts_with("sha256:"));
    assert_ne!(Some(raw), record.checksum.as_deref(), "raw and stored checksums differ once compressed");
    let raw_size: u64 = record.meta(keys::RAW_SIZE_BYTES).unwrap().parse().unwrap();
    assert!(raw_size > 0);

    let key = record.meta(keys::STORAGE_KEY).unwrap();
    assert_eq!(key, format!("file_tree/home/{}.zip.bz2", record.id));
    assert_eq!(ctx.stored_files(), vec![PathBuf::from(key)]);
}

#[test]
fn test_encrypted_backup() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let mut job = file_tree_job("home", &["app"]);
    job.encrypt = true;
    let record = engine.create_backup(&job).assert_ok();

    assert_eq!(record.status, BackupStatus::Verified);
    assert_eq!(record.transforms(), "compress,encrypt");
    assert_eq!(record.meta(keys::ENCRYPTION), Some("aes-256-gcm-stream"));
    assert!(record.location_uri.as_deref().unwrap().ends_with(".zip.bz2.enc"));

    // The stored bytes are not a readable archive
    let stored = std::fs::read(record.location_uri.unwrap()).unwrap();
    assert!(!stored.starts_with(b"PK"));
    assert!(!stored.starts_with(b"BZh"));
}

#[test]
fn test_backup_without_transforms_stores_raw_artifact() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let mut job = file_tree_job("home", &["app"]);
    job.compress = false;
    let record = engine.create_backup(&job).assert_ok();

    assert_eq!(record.transforms(), "");
    assert_eq!(record.raw_checksum(), record.checksum.as_deref());
    assert!(record.location_uri.as_deref().unwrap().ends_with(".zip"));
}

#[test]
fn test_backup_without_verification_is_completed() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let mut job = file_tree_job("home", &["app"]);
    job.verify_integrity = false;
    let record = engine.create_backup(&job).assert_ok();

    assert_eq!(record.status, BackupStatus::Completed);
    assert!(record.verified_at.is_none());
    assert!(record.checksum.is_some());
}

#[test]
fn test_media_backup() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let mut job = file_tree_job("uploads", &["media"]);
    job.kind = BackupKind::MediaArchive;
    let record = engine.create_backup(&job).assert_ok();

    assert_eq!(record.kind, BackupKind::MediaArchive);
    assert_eq!(record.status, BackupStatus::Verified);
    assert_eq!(record.meta("media_directories"), Some("media"));
}

#[test]
fn test_caller_metadata_cannot_override_engine_keys() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let mut job = file_tree_job("home", &["app"]);
    job.metadata.insert("owner".to_string(), "ops".to_string());
    job.metadata.insert(keys::RAW_CHECKSUM.to_string(), "sha256:bogus".to_string());
    job.metadata.insert(keys::TRANSFORMS.to_string(), "encrypt".to_string());
    let record = engine.create_backup(&job).assert_ok();

    assert_eq!(record.meta("owner"), Some("ops"));
    assert_ne!(record.raw_checksum(), Some("sha256:bogus"));
    assert_eq!(record.transforms(), "compress");
}

#[test]
fn test_each_run_gets_its_own_record_and_location() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();
    let job = file_tree_job("home", &["app"]);

    let first = engine.create_backup(&job).assert_ok();
    let second = engine.create_backup(&job).assert_ok();

    assert_ne!(first.id, second.id);
    assert_ne!(first.location_uri, second.location_uri);
    assert_eq!(ctx.stored_files().len(), 2);

    let listed = engine.list(&RecordFilter::new().job_name("home")).unwrap();
    let ids: Vec<_> = listed.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[test]
fn test_invalid_job_name_creates_no_record() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let result = engine.create_backup(&file_tree_job("../escape", &["app"]));
    assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    assert!(engine.list(&RecordFilter::new()).unwrap().is_empty());
}

#[test]
fn test_kind_without_capturer_is_rejected() {
    let ctx = TestContext::new();
    let engine = ctx.engine();

    let mut job = file_tree_job("db-daily", &[]);
    job.kind = BackupKind::Database;
    let result = engine.create_backup(&job);

    assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    assert!(engine.list(&RecordFilter::new()).unwrap().is_empty());
}

#[test]
fn test_unconfigured_storage_is_rejected() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let mut job = file_tree_job("home", &["app"]);
    job.storage_provider = StorageProvider::S3;
    let result = engine.create_backup(&job);

    assert!(matches!(result, Err(EngineError::StorageRejected(_))));
    assert!(engine.list(&RecordFilter::new()).unwrap().is_empty());
}

#[test]
fn test_nothing_to_capture_fails_the_record() {
    let ctx = TestContext::new();
    let engine = ctx.engine();

    let result = engine.create_backup(&file_tree_job("empty", &["does-not-exist"]));
    assert!(matches!(result, Err(EngineError::Capture(_))));

    let records = engine.list(&RecordFilter::new()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Failed);
    assert_eq!(records[0].meta(keys::ERROR_KIND), Some("capture"));
    assert!(records[0].location_uri.is_none());
}

#[test]
fn test_storage_outage_is_transient() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    ctx.backend().fail_put(Failure::Unavailable);
    let engine = ctx.engine();

    let err = engine.create_backup(&file_tree_job("home", &["app"])).unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert!(err.is_transient());

    let events = ctx.reporter().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::BackupFailed);
    assert_eq!(events[0].error_kind, Some("storage_unavailable"));
    assert!(events[0].backup_id.is_some());

    // After the outage the job succeeds again
    ctx.backend().heal();
    engine.create_backup(&file_tree_job("home", &["app"])).assert_ok();
}

#[test]
fn test_cancelled_before_start() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();

    let cancel = CancelToken::new();
    cancel.cancel();
    let result = engine.create_backup_with(&file_tree_job("home", &["app"]), &cancel);

    assert!(matches!(result, Err(EngineError::Cancelled(_))));
    let records = engine.list(&RecordFilter::new()).unwrap();
    assert_eq!(records[0].status, BackupStatus::Failed);
    assert_eq!(records[0].meta(keys::ERROR_KIND), Some("cancelled"));
    assert!(ctx.stored_files().is_empty());
    assert_eq!(ctx.work_dir_entries(), 0);
}

#[test]
fn test_long_running_is_reported_once() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx
        .engine_builder()
        .long_running_threshold(std::time::Duration::ZERO)
        .build();

    engine.create_backup(&file_tree_job("home", &["app"])).assert_ok();

    assert_eq!(ctx.reporter().count(EventKind::LongRunning), 1);
    assert_eq!(ctx.reporter().count(EventKind::BackupCompleted), 1);
}
