//! Tests for on-demand integrity verification

use backup_engine::error::EngineError;
use backup_engine::managers::notification::EventKind;
use backup_engine::managers::restore::RestoreMode;
use std::fs;
use std::path::PathBuf;
use test_utils::{
    file_tree_job, sample_tree, BackupRecord, BackupStatus, Failure, ResultAssertions, TestContext,
};

fn backup(ctx: &TestContext) -> BackupRecord {
    sample_tree(&ctx.source_dir());
    ctx.engine().create_backup(&file_tree_job("home", &["app"])).assert_ok()
}

fn flip_byte(path: &PathBuf) {
    let mut bytes = fs::read(path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(path, bytes).unwrap();
}

#[test]
fn test_intact_backup_is_verified() {
    let ctx = TestContext::new();
    let record = backup(&ctx);
    ctx.reporter().clear();

    let result = ctx.engine().verify_integrity(&record.id).assert_ok();

    assert!(result.is_intact());
    assert_eq!(result.status, BackupStatus::Verified);
    assert_eq!(Some(result.actual.as_str()), record.checksum.as_deref());
    assert_eq!(result.expected, result.actual);

    let stored = ctx.registry().get(&record.id).unwrap();
    assert_eq!(stored.status, BackupStatus::Verified);
    assert_eq!(stored.verified_at, Some(result.verified_at));
    assert!(ctx.reporter().events().is_empty());
}

#[test]
fn test_single_flipped_byte_marks_record_corrupted() {
    let ctx = TestContext::new();
    let record = backup(&ctx);
    flip_byte(&PathBuf::from(record.location_uri.clone().unwrap()));
    let engine = ctx.engine();

    let result = engine.verify_integrity(&record.id).assert_ok();

    assert!(!result.is_intact());
    assert_eq!(result.status, BackupStatus::Corrupted);
    assert_ne!(result.expected, result.actual);
    assert_eq!(ctx.registry().get(&record.id).unwrap().status, BackupStatus::Corrupted);

    let events = ctx.reporter().events();
    let corrupted: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Corrupted).collect();
    assert_eq!(corrupted.len(), 1);
    assert_eq!(corrupted[0].backup_id.as_deref(), Some(record.id.as_str()));

    // A corrupted backup is never restored
    assert!(matches!(
        engine.restore(&record.id, RestoreMode::VerifyOnly),
        Err(EngineError::Corrupted { .. })
    ));
}

#[test]
fn test_missing_artifact_leaves_record_untouched() {
    let ctx = TestContext::new();
    let record = backup(&ctx);
    fs::remove_file(record.location_uri.clone().unwrap()).unwrap();

    let result = ctx.engine().verify_integrity(&record.id);

    assert!(matches!(result, Err(EngineError::StorageNotFound(_))));
    let stored = ctx.registry().get(&record.id).unwrap();
    assert_eq!(stored.status, BackupStatus::Verified);
    assert_eq!(stored.verified_at, record.verified_at);
}

#[test]
fn test_verify_downloads_from_remote_storage() {
    let ctx = TestContext::remote();
    let record = backup(&ctx);
    let uri = record.location_uri.clone().unwrap();

    let result = ctx.engine().verify_integrity(&record.id).assert_ok();

    assert!(result.is_intact());
    assert!(ctx.backend().calls().contains(&format!("get:{}", uri)));
    assert_eq!(ctx.work_dir_entries(), 0, "the download is removed afterwards");
}

#[test]
fn test_unreachable_storage_is_not_corruption() {
    let ctx = TestContext::remote();
    let record = backup(&ctx);
    ctx.backend().fail_get(Failure::Unavailable);

    let err = ctx.engine().verify_integrity(&record.id).unwrap_err();

    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert!(err.is_transient());
    assert_eq!(ctx.registry().get(&record.id).unwrap().status, BackupStatus::Verified);
    assert_eq!(ctx.reporter().count(EventKind::Corrupted), 0);
}

#[test]
fn test_verify_unknown_or_deleted_is_not_found() {
    let ctx = TestContext::new();
    let record = backup(&ctx);
    let engine = ctx.engine();

    assert!(matches!(
        engine.verify_integrity("nonexistent-id"),
        Err(EngineError::NotFound(_))
    ));

    engine.purge(&record.id).assert_ok();
    assert!(matches!(
        engine.verify_integrity(&record.id),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn test_reverify_after_repair() {
    let ctx = TestContext::new();
    let record = backup(&ctx);
    let stored = PathBuf::from(record.location_uri.clone().unwrap());
    let engine = ctx.engine();

    flip_byte(&stored);
    assert_eq!(engine.verify_integrity(&record.id).unwrap().status, BackupStatus::Corrupted);

    // Flipping the same bit back restores the original bytes
    flip_byte(&stored);
    assert_eq!(engine.verify_integrity(&record.id).unwrap().status, BackupStatus::Verified);
}
