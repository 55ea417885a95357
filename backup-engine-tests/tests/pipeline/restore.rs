//! Tests for restoring backups
//!
//! Restores reverse the pipeline and must never touch the target until the
//! reconstructed artifact matches its recorded raw checksum.

use backup_engine::error::EngineError;
use backup_engine::integrity::IntegrityError;
use backup_engine::managers::notification::EventKind;
use backup_engine::managers::restore::{RestoreMode, RestoreOptions};
use backup_engine::registry::keys;
use backup_engine::secrets::{EncryptionKey, StaticKeyProvider};
use backup_engine::strategies::UserDataCapturer;
use backup_engine::utils::cancel::CancelToken;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use test_utils::{
    file_tree_job, sample_tree, sample_user_data, BackupConfig, BackupKind, BackupRecord,
    BackupStatus, MemoryUserData, ResultAssertions, StorageProvider, TestContext,
};

fn backup_home(ctx: &TestContext, encrypt: bool) -> BackupRecord {
    sample_tree(&ctx.source_dir());
    let mut job = file_tree_job("home", &["app", "media"]);
    job.encrypt = encrypt;
    ctx.engine().create_backup(&job).assert_ok()
}

fn assert_sample_tree(root: &std::path::Path) {
    assert_eq!(fs::read(root.join("app/config.toml")).unwrap(), b"[server]\nport = 8080\n");
    assert_eq!(
        fs::read(root.join("app/data/records.csv")).unwrap(),
        b"id,name\n1,alpha\n2,bravo\n"
    );
    assert_eq!(fs::read(root.join("app/logs/today.log")).unwrap(), b"started\nstopped\n");
    assert_eq!(
        fs::read(root.join("media/logo.png")).unwrap(),
        vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3]
    );
}

#[test]
fn test_full_restore_of_file_tree() {
    let ctx = TestContext::new();
    let record = backup_home(&ctx, false);
    let engine = ctx.engine();
    ctx.reporter().clear();

    let target = ctx.temp_dir().join("restored");
    let options = RestoreOptions::full().with_target_dir(&target);
    let result = engine.restore_with(&record.id, &options, &CancelToken::new()).assert_ok();

    assert!(result.applied);
    assert_eq!(result.mode, RestoreMode::Full);
    assert_eq!(result.kind, BackupKind::FileTree);
    assert_eq!(Some(result.raw_checksum.as_str()), record.raw_checksum());
    assert!(result.pre_restore_checksum.is_none());
    assert_sample_tree(&target);

    assert_eq!(ctx.reporter().kinds(), vec![EventKind::RestoreCompleted]);
    assert_eq!(ctx.work_dir_entries(), 0);
    // The stored artifact is read in place, never consumed
    assert!(PathBuf::from(record.location_uri.unwrap()).is_file());
}

#[test]
fn test_full_restore_of_encrypted_backup() {
    let ctx = TestContext::new();
    let record = backup_home(&ctx, true);
    assert_eq!(record.transforms(), "compress,encrypt");

    let target = ctx.temp_dir().join("restored");
    ctx.engine()
        .restore_with(&record.id, &RestoreOptions::full().with_target_dir(&target), &CancelToken::new())
        .assert_ok();

    assert_sample_tree(&target);
}

#[test]
fn test_verify_only_reproduces_raw_checksum() {
    let ctx = TestContext::new();
    let record = backup_home(&ctx, true);
    ctx.reporter().clear();

    let result = ctx.engine().restore(&record.id, RestoreMode::VerifyOnly).assert_ok();

    assert!(!result.applied);
    assert_eq!(result.mode, RestoreMode::VerifyOnly);
    assert_eq!(Some(result.raw_checksum.as_str()), record.raw_checksum());
    assert!(ctx.reporter().events().is_empty(), "verify-only restores report nothing on success");
    assert_eq!(ctx.work_dir_entries(), 0);
}

#[test]
fn test_verify_only_downloads_from_remote_storage() {
    let ctx = TestContext::remote();
    let record = backup_home(&ctx, true);

    let result = ctx.engine().restore(&record.id, RestoreMode::VerifyOnly).assert_ok();
    assert_eq!(Some(result.raw_checksum.as_str()), record.raw_checksum());

    let uri = record.location_uri.unwrap();
    assert!(ctx.backend().calls().contains(&format!("get:{}", uri)));
    assert!(PathBuf::from(&uri).is_file(), "the stored artifact is left in place");
    assert_eq!(ctx.work_dir_entries(), 0, "the download is removed with the workspace");
}

#[test]
fn test_wrong_key_fails_closed() {
    let ctx = TestContext::new();
    let record = backup_home(&ctx, true);

    // Same registry and store, different key
    let engine = ctx
        .engine_builder()
        .secrets(Arc::new(StaticKeyProvider::new(EncryptionKey::from_bytes([1u8; 32]))))
        .build();

    let target = ctx.temp_dir().join("restored");
    let result = engine.restore_with(&record.id, &RestoreOptions::full().with_target_dir(&target), &CancelToken::new());

    assert!(matches!(result, Err(EngineError::Decryption(_))));
    assert!(!target.exists(), "nothing may be written to the target");
    assert_eq!(ctx.reporter().count(EventKind::RestoreFailed), 1);
    assert_eq!(ctx.work_dir_entries(), 0);
}

#[test]
fn test_tampered_raw_artifact_is_refused() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let mut job = file_tree_job("home", &["app"]);
    job.compress = false;
    job.verify_integrity = false;
    let engine = ctx.engine();
    let record = engine.create_backup(&job).assert_ok();

    // Flip one byte of the stored archive
    let stored = PathBuf::from(record.location_uri.clone().unwrap());
    let mut bytes = fs::read(&stored).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    fs::write(&stored, bytes).unwrap();

    let target = ctx.temp_dir().join("restored");
    let result = engine.restore_with(&record.id, &RestoreOptions::full().with_target_dir(&target), &CancelToken::new());

    assert!(matches!(
        result,
        Err(EngineError::Integrity(IntegrityError::Mismatch { .. }))
    ));
    assert!(!target.exists());
    assert_eq!(ctx.work_dir_entries(), 0);
}

#[test]
fn test_unknown_id_is_not_found() {
    let ctx = TestContext::new();
    let engine = ctx.engine();

    let result = engine.restore("nonexistent-id", RestoreMode::Full);
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    assert!(ctx.backend().calls().is_empty());
    assert!(ctx.reporter().events().is_empty());
}

#[test]
fn test_full_restore_needs_target_dir() {
    let ctx = TestContext::remote();
    let record = backup_home(&ctx, false);
    let calls_before = ctx.backend().calls().len();

    let result = ctx.engine().restore(&record.id, RestoreMode::Full);

    assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    assert_eq!(ctx.backend().calls().len(), calls_before, "nothing is fetched");
}

#[test]
fn test_missing_artifact_is_storage_not_found() {
    let ctx = TestContext::new();
    let record = backup_home(&ctx, false);
    fs::remove_file(record.location_uri.clone().unwrap()).unwrap();

    let result = ctx.engine().restore(&record.id, RestoreMode::VerifyOnly);
    assert!(matches!(result, Err(EngineError::StorageNotFound(_))));
}

#[test]
fn test_unsettled_and_corrupted_records_are_refused() {
    let ctx = TestContext::new();
    let record = backup_home(&ctx, false);
    let engine = ctx.engine();
    let registry = engine.registry();

    registry.transition(&record.id, BackupStatus::Corrupted).unwrap();
    assert!(matches!(
        engine.restore(&record.id, RestoreMode::VerifyOnly),
        Err(EngineError::Corrupted { .. })
    ));

    let mut failed = record.clone();
    failed.id = "home-failed".to_string();
    failed.location_uri = None;
    failed.status = BackupStatus::Failed;
    registry.create(failed).unwrap();
    assert!(matches!(
        engine.restore("home-failed", RestoreMode::VerifyOnly),
        Err(EngineError::InvalidRequest(_))
    ));
}

#[test]
fn test_user_data_round_trip() {
    let ctx = TestContext::new();
    let store = MemoryUserData::new();
    for (name, records) in sample_user_data() {
        store.set(name, records);
    }
    let capturer = UserDataCapturer::new(Arc::new(store.clone())).with_sink(Arc::new(store.clone()));
    let engine = ctx.engine_builder().capturer(Arc::new(capturer)).build();

    let job = BackupConfig::new("accounts", BackupKind::UserDataExport, StorageProvider::Local);
    let record = engine.create_backup(&job).assert_ok();
    assert_eq!(record.status, BackupStatus::Verified);
    assert_eq!(record.meta("collection_count"), Some("3"));
    assert_eq!(record.meta("record_count"), Some("5"));
    assert_eq!(record.meta(keys::ARTIFACT_NAME), Some("accounts.zip"));

    // Live data drifts after the backup
    store.set("users", vec![json!({"id": 3, "name": "Grace", "role": "admin"})]);
    store.set("projects", vec![]);

    let result = engine
        .restore_with(&record.id, &RestoreOptions::full(), &CancelToken::new())
        .assert_ok();

    assert!(result.applied);
    assert!(result.pre_restore_checksum.is_some(), "destructive restores checksum the state they replace");
    for (name, records) in sample_user_data() {
        assert_eq!(store.get(name), records, "collection '{}' restored", name);
    }
}
