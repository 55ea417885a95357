//! Tests for retention sweeps and purges

use backup_engine::error::EngineError;
use backup_engine::managers::notification::EventKind;
use backup_engine::utils::cancel::CancelToken;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use test_utils::{
    file_tree_job, record_at, sample_tree, BackupKind, BackupStatus, Failure, Frequency,
    ResultAssertions, TestContext,
};

/// Register a settled record with a real artifact in the store
fn seed(
    ctx: &TestContext,
    id: &str,
    kind: BackupKind,
    frequency: Frequency,
    status: BackupStatus,
    created_at: DateTime<Utc>,
) -> String {
    let path = ctx.store_dir().join(format!("{}/{}.zip", kind, id));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, id.as_bytes()).unwrap();
    let uri = path.to_string_lossy().to_string();
    ctx.registry()
        .create(record_at(id, kind, frequency, status, created_at, &uri))
        .unwrap();
    uri
}

#[test]
fn test_sweep_deletes_only_expired_backups() {
    let ctx = TestContext::new();
    let now = Utc::now();
    let old_uri = seed(&ctx, "old", BackupKind::FileTree, Frequency::Daily, BackupStatus::Verified, now - Duration::days(31));
    let older_uri = seed(&ctx, "older", BackupKind::FileTree, Frequency::Daily, BackupStatus::Completed, now - Duration::days(90));
    let fresh_uri = seed(&ctx, "fresh", BackupKind::FileTree, Frequency::Daily, BackupStatus::Verified, now - Duration::days(29));
    let engine = ctx.engine();

    let result = engine
        .retention()
        .sweep_at(BackupKind::FileTree, Frequency::Daily, 30, now, &CancelToken::new())
        .assert_ok();

    assert!(result.is_clean());
    assert_eq!(result.cutoff, now - Duration::days(30));
    let mut deleted = result.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["old", "older"]);
    assert_eq!(result.retained, 1);

    assert!(!std::path::Path::new(&old_uri).exists());
    assert!(!std::path::Path::new(&older_uri).exists());
    assert!(std::path::Path::new(&fresh_uri).exists());
    assert_eq!(ctx.registry().get("old").unwrap().status, BackupStatus::Deleted);
    assert_eq!(ctx.registry().get("fresh").unwrap().status, BackupStatus::Verified);

    let events = ctx.reporter().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::RetentionSwept);
    assert_eq!(events[0].backup_kind, Some(BackupKind::FileTree));
}

#[test]
fn test_record_on_cutoff_is_kept() {
    let ctx = TestContext::new();
    let now = Utc::now();
    let cutoff = now - Duration::days(7);
    seed(&ctx, "on-cutoff", BackupKind::MediaArchive, Frequency::Weekly, BackupStatus::Verified, cutoff);
    seed(&ctx, "just-before", BackupKind::MediaArchive, Frequency::Weekly, BackupStatus::Verified, cutoff - Duration::nanoseconds(1));

    let result = ctx
        .engine()
        .retention()
        .sweep_at(BackupKind::MediaArchive, Frequency::Weekly, 7, now, &CancelToken::new())
        .assert_ok();

    assert_eq!(result.deleted, vec!["just-before"]);
    assert_eq!(ctx.registry().get("on-cutoff").unwrap().status, BackupStatus::Verified);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Records are placed within a few minutes of the cutoff, including
    /// exactly on it; only those strictly before it go
    #[test]
    fn prop_sweep_deletes_exactly_records_before_cutoff(
        records in prop::collection::vec((-180i64..=180, any::<bool>()), 0..50)
    ) {
        let ctx = TestContext::new();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let cutoff = now - Duration::days(30);

        let mut expected = BTreeSet::new();
        for (i, (offset_secs, verified)) in records.iter().enumerate() {
            let id = format!("rec-{:03}", i);
            let status = if *verified { BackupStatus::Verified } else { BackupStatus::Completed };
            let created_at = cutoff + Duration::seconds(*offset_secs);
            seed(&ctx, &id, BackupKind::FileTree, Frequency::Daily, status, created_at);
            if created_at < cutoff {
                expected.insert(id);
            }
        }

        let result = ctx
            .engine()
            .retention()
            .sweep_at(BackupKind::FileTree, Frequency::Daily, 30, now, &CancelToken::new())
            .unwrap();

        prop_assert_eq!(result.cutoff, cutoff);
        prop_assert!(result.failed.is_empty());
        let deleted: BTreeSet<String> = result.deleted.iter().cloned().collect();
        prop_assert_eq!(&deleted, &expected);
        prop_assert_eq!(result.retained, records.len() - expected.len());

        for (i, (_, verified)) in records.iter().enumerate() {
            let id = format!("rec-{:03}", i);
            let status = ctx.registry().get(&id).unwrap().status;
            if expected.contains(&id) {
                prop_assert_eq!(status, BackupStatus::Deleted);
            } else if *verified {
                prop_assert_eq!(status, BackupStatus::Verified);
            } else {
                prop_assert_eq!(status, BackupStatus::Completed);
            }
        }
    }
}

#[test]
fn test_sweep_leaves_other_kinds_frequencies_and_statuses() {
    let ctx = TestContext::new();
    let now = Utc::now();
    let long_ago = now - Duration::days(400);
    seed(&ctx, "db", BackupKind::Database, Frequency::Daily, BackupStatus::Verified, long_ago);
    seed(&ctx, "weekly", BackupKind::FileTree, Frequency::Weekly, BackupStatus::Verified, long_ago);
    seed(&ctx, "corrupt", BackupKind::FileTree, Frequency::Daily, BackupStatus::Corrupted, long_ago);

    let result = ctx
        .engine()
        .retention()
        .sweep_at(BackupKind::FileTree, Frequency::Daily, 30, now, &CancelToken::new())
        .assert_ok();

    assert!(result.deleted.is_empty());
    assert_eq!(result.retained, 0);
    for id in ["db", "weekly", "corrupt"] {
        assert_ne!(ctx.registry().get(id).unwrap().status, BackupStatus::Deleted, "{} kept", id);
    }
    assert!(ctx.reporter().events().is_empty(), "an empty sweep reports nothing");
}

#[test]
fn test_failed_delete_keeps_record_for_next_sweep() {
    let ctx = TestContext::new();
    let now = Utc::now();
    let stuck_uri = seed(&ctx, "stuck", BackupKind::FileTree, Frequency::Daily, BackupStatus::Verified, now - Duration::days(60));
    seed(&ctx, "gone", BackupKind::FileTree, Frequency::Daily, BackupStatus::Verified, now - Duration::days(60));
    ctx.backend().fail_delete(&stuck_uri, Failure::Unavailable);
    let engine = ctx.engine();

    let result = engine
        .retention()
        .sweep_at(BackupKind::FileTree, Frequency::Daily, 30, now, &CancelToken::new())
        .assert_ok();

    assert!(!result.is_clean());
    assert_eq!(result.deleted, vec!["gone"]);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, "stuck");
    assert_eq!(ctx.registry().get("stuck").unwrap().status, BackupStatus::Verified);
    assert!(std::path::Path::new(&stuck_uri).exists());

    let events = ctx.reporter().events();
    assert_eq!(events[0].kind, EventKind::RetentionSwept);
    assert!(events[0].error.is_some());

    // Next sweep picks it up once storage is back
    ctx.backend().heal();
    let retry = engine
        .retention()
        .sweep_at(BackupKind::FileTree, Frequency::Daily, 30, now, &CancelToken::new())
        .assert_ok();
    assert_eq!(retry.deleted, vec!["stuck"]);
    assert!(retry.is_clean());
}

#[test]
fn test_artifact_already_gone_counts_as_deleted() {
    let ctx = TestContext::new();
    let now = Utc::now();
    let uri = seed(&ctx, "vanished", BackupKind::FileTree, Frequency::Daily, BackupStatus::Completed, now - Duration::days(45));
    fs::remove_file(&uri).unwrap();

    let result = ctx
        .engine()
        .retention()
        .sweep_at(BackupKind::FileTree, Frequency::Daily, 30, now, &CancelToken::new())
        .assert_ok();

    assert_eq!(result.deleted, vec!["vanished"]);
    assert!(result.is_clean());
    assert_eq!(ctx.registry().get("vanished").unwrap().status, BackupStatus::Deleted);
}

#[test]
fn test_cancelled_sweep_stops() {
    let ctx = TestContext::new();
    let now = Utc::now();
    seed(&ctx, "old", BackupKind::FileTree, Frequency::Daily, BackupStatus::Verified, now - Duration::days(60));
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = ctx
        .engine()
        .retention()
        .sweep_at(BackupKind::FileTree, Frequency::Daily, 30, now, &cancel);

    assert!(matches!(result, Err(EngineError::Cancelled(_))));
    assert_eq!(ctx.registry().get("old").unwrap().status, BackupStatus::Verified);
}

#[test]
fn test_default_retention_by_frequency() {
    let ctx = TestContext::new();
    let engine = ctx.engine();

    assert_eq!(engine.default_retention_days(Frequency::Daily), 30);
    assert_eq!(engine.default_retention_days(Frequency::Weekly), 90);
    assert_eq!(engine.default_retention_days(Frequency::Monthly), 365);
}

#[test]
fn test_purge_removes_artifact_and_marks_deleted() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();
    let record = engine.create_backup(&file_tree_job("home", &["app"])).assert_ok();
    let uri = record.location_uri.clone().unwrap();

    let purged = engine.purge(&record.id).assert_ok();

    assert_eq!(purged.status, BackupStatus::Deleted);
    assert!(!std::path::Path::new(&uri).exists());
    assert!(ctx.stored_files().is_empty());

    // Deleted records are invisible to further purges
    assert!(matches!(engine.purge(&record.id), Err(EngineError::NotFound(_))));
}

#[test]
fn test_purge_refuses_running_backup() {
    let ctx = TestContext::new();
    let uri = seed(&ctx, "busy", BackupKind::FileTree, Frequency::Daily, BackupStatus::Running, Utc::now());

    let result = ctx.engine().purge("busy");

    assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    assert!(std::path::Path::new(&uri).exists());
    assert_eq!(ctx.registry().get("busy").unwrap().status, BackupStatus::Running);
}

#[test]
fn test_forget_drops_deleted_and_failed_records() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();
    let record = engine.create_backup(&file_tree_job("home", &["app"])).assert_ok();
    engine.purge(&record.id).assert_ok();
    seed(&ctx, "broken", BackupKind::FileTree, Frequency::Daily, BackupStatus::Failed, Utc::now());

    assert_eq!(engine.forget(&record.id).assert_ok().status, BackupStatus::Deleted);
    assert_eq!(engine.forget("broken").assert_ok().status, BackupStatus::Failed);

    assert!(ctx.registry().find(&record.id).unwrap().is_none());
    assert!(ctx.registry().find("broken").unwrap().is_none());
    assert!(matches!(engine.forget(&record.id), Err(EngineError::NotFound(_))));
}

#[test]
fn test_forget_refuses_backups_with_artifacts() {
    let ctx = TestContext::new();
    let uri = seed(&ctx, "kept", BackupKind::FileTree, Frequency::Daily, BackupStatus::Verified, Utc::now());

    let result = ctx.engine().forget("kept");

    assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    assert!(std::path::Path::new(&uri).exists());
    assert_eq!(ctx.registry().get("kept").unwrap().status, BackupStatus::Verified);
}
