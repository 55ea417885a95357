//! Tests for overlapping runs
//!
//! Two runs of the same job never overlap: the second is refused at once and
//! leaves no record. Different jobs run side by side.

use backup_engine::error::EngineError;
use backup_engine::strategies::FileTreeCapturer;
use backup_engine::utils::locker::RunLocks;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use test_utils::{
    file_tree_job, sample_tree, BackupStatus, GatedCapturer, RecordFilter, ResultAssertions,
    TestContext,
};

const GATE_TIMEOUT: Duration = Duration::from_secs(10);

fn gated(ctx: &TestContext) -> GatedCapturer {
    GatedCapturer::new(Arc::new(FileTreeCapturer::new(&ctx.source_dir())))
}

#[test]
fn test_second_run_of_same_job_is_refused() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let gate = gated(&ctx);
    let engine = ctx.engine_builder().capturer(Arc::new(gate.clone())).build();
    let job = file_tree_job("home", &["app"]);

    thread::scope(|s| {
        let first = s.spawn(|| engine.create_backup(&job));
        assert!(gate.wait_entered(1, GATE_TIMEOUT), "first run never reached capture");

        let second = engine.create_backup(&job);
        assert!(matches!(second, Err(EngineError::ConcurrentRun(ref name)) if name == "home"));

        gate.open();
        let record = first.join().unwrap().assert_ok();
        assert_eq!(record.status, BackupStatus::Verified);
    });

    let records = engine.list(&RecordFilter::new()).unwrap();
    assert_eq!(records.len(), 1, "the refused run leaves no record");
    assert!(ctx.reporter().events().iter().all(|e| e.error_kind != Some("concurrent_run")));
}

#[test]
fn test_lock_is_released_after_run() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let engine = ctx.engine();
    let job = file_tree_job("home", &["app"]);

    engine.create_backup(&job).assert_ok();
    engine.create_backup(&job).assert_ok();

    assert_eq!(engine.list(&RecordFilter::new()).unwrap().len(), 2);
}

#[test]
fn test_lock_is_released_after_failure() {
    let ctx = TestContext::new();
    let engine = ctx.engine();

    engine
        .create_backup(&file_tree_job("home", &["missing"]))
        .unwrap_err();
    sample_tree(&ctx.source_dir());
    engine.create_backup(&file_tree_job("home", &["app"])).assert_ok();
}

#[test]
fn test_different_jobs_run_in_parallel() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let gate = gated(&ctx);
    let engine = ctx.engine_builder().capturer(Arc::new(gate.clone())).build();
    let app = file_tree_job("app", &["app"]);
    let media = file_tree_job("media", &["media"]);

    thread::scope(|s| {
        let first = s.spawn(|| engine.create_backup(&app));
        let second = s.spawn(|| engine.create_backup(&media));

        // Both runs are inside capture at the same time
        assert!(gate.wait_entered(2, GATE_TIMEOUT), "runs of different jobs must not exclude each other");
        gate.open();

        first.join().unwrap().assert_ok();
        second.join().unwrap().assert_ok();
    });

    assert_eq!(ctx.stored_files().len(), 2);
}

#[test]
fn test_lock_directory_excludes_other_engines() {
    let ctx = TestContext::new();
    sample_tree(&ctx.source_dir());
    let lock_dir = ctx.create_subdir("locks");
    let gate = gated(&ctx);

    let holder = ctx
        .engine_builder()
        .capturer(Arc::new(gate.clone()))
        .locks(RunLocks::new(Some(lock_dir.clone())))
        .build();
    // A second engine, as another process sharing the lock directory would have
    let other = ctx.engine_builder().locks(RunLocks::new(Some(lock_dir))).build();
    let job = file_tree_job("home", &["app"]);

    thread::scope(|s| {
        let first = s.spawn(|| holder.create_backup(&job));
        assert!(gate.wait_entered(1, GATE_TIMEOUT));

        assert!(matches!(other.create_backup(&job), Err(EngineError::ConcurrentRun(_))));

        gate.open();
        first.join().unwrap().assert_ok();
    });

    other.create_backup(&job).assert_ok();
    assert_eq!(ctx.registry().query(&RecordFilter::new()).unwrap().len(), 2);
}

#[test]
fn test_run_locks_report_held_names() {
    let locks = RunLocks::in_process();

    let inner: Result<bool, EngineError> = locks.with_lock("home", || Ok(locks.is_held("home")));
    assert!(inner.unwrap());
    assert!(!locks.is_held("home"));

    let nested: Result<(), EngineError> = locks.with_lock("home", || locks.with_lock("home", || Ok(())));
    assert!(matches!(nested, Err(EngineError::ConcurrentRun(_))));
}
