//! Tests for cleanup after failed runs
//!
//! Whatever stage fails, the run workspace is removed, nothing half-written
//! reaches storage and the record ends `Failed` with the error kind.

use backup_engine::error::EngineError;
use backup_engine::managers::notification::EventKind;
use backup_engine::registry::keys;
use backup_engine::secrets::StaticKeyProvider;
use backup_engine::transform::{StageKind, StandardTransforms};
use rstest::rstest;
use std::sync::Arc;
use test_utils::{
    file_tree_job, sample_tree, test_key, BackupKind, BackupStatus, FailingCapturer,
    FailingTransforms, Failure, RecordFilter, TestContext,
};

#[derive(Debug, Clone, Copy)]
enum Stage {
    Capture,
    Compress,
    Encrypt,
    Upload,
}

fn real_transforms() -> Arc<StandardTransforms> {
    Arc::new(StandardTransforms::new(6, Arc::new(StaticKeyProvider::new(test_key()))))
}

#[rstest]
#[case::capture(Stage::Capture, "capture")]
#[case::compress(Stage::Compress, "transform")]
#[case::encrypt(Stage::Encrypt, "transform")]
#[case::upload(Stage::Upload, "storage_unavailable")]
fn test_failed_stage_leaves_nothing_behind(#[case] stage: Stage, #[case] expected_kind: &str) {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());

    let mut builder = ctx.engine_builder();
    match stage {
        Stage::Capture => builder = builder.capturer(Arc::new(FailingCapturer::new(BackupKind::FileTree))),
        Stage::Compress => {
            builder = builder.transforms(Arc::new(FailingTransforms::new(real_transforms(), StageKind::Compress)))
        }
        Stage::Encrypt => {
            builder = builder.transforms(Arc::new(FailingTransforms::new(real_transforms(), StageKind::Encrypt)))
        }
        Stage::Upload => ctx.backend().fail_put(Failure::Unavailable),
    }
    let engine = builder.build();

    let mut job = file_tree_job("home", &["app"]);
    job.encrypt = true;
    let err = engine.create_backup(&job).unwrap_err();
    assert_eq!(err.kind(), expected_kind, "{:?} failure surfaced as {}", stage, err);

    assert_eq!(ctx.work_dir_entries(), 0, "workspace removed after {:?} failure", stage);
    assert!(ctx.stored_files().is_empty(), "nothing stored after {:?} failure", stage);

    let records = engine.list(&RecordFilter::new()).unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, BackupStatus::Failed);
    assert_eq!(record.meta(keys::ERROR_KIND), Some(expected_kind));
    assert!(record.meta(keys::ERROR).is_some());
    assert!(record.location_uri.is_none());

    let events = ctx.reporter().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::BackupFailed);
    assert_eq!(events[0].error_kind, Some(err.kind()));
}

#[test]
fn test_cancel_during_run_cleans_up() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx
        .engine_builder()
        .run_timeout(std::time::Duration::ZERO)
        .build();

    let result = engine.create_backup(&file_tree_job("home", &["app"]));

    assert!(matches!(result, Err(EngineError::Cancelled(_))));
    assert_eq!(ctx.work_dir_entries(), 0);
    assert!(ctx.stored_files().is_empty());
    let records = engine.list(&RecordFilter::new()).unwrap();
    assert_eq!(records[0].status, BackupStatus::Failed);
}

#[test]
fn test_failed_run_does_not_block_the_next_one() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    ctx.backend().fail_put(Failure::Unavailable);
    let engine = ctx.engine();
    let job = file_tree_job("home", &["app"]);

    engine.create_backup(&job).unwrap_err();
    ctx.backend().heal();
    let record = engine.create_backup(&job).unwrap();

    assert_eq!(record.status, BackupStatus::Verified);
    assert_eq!(ctx.stored_files().len(), 1);
}
