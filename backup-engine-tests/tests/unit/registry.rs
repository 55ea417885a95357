//! Unit tests for the JSON file registry shared between engine instances

use backup_engine::registry::{BackupRegistry, JsonFileRegistry, RegistryError};
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::thread;
use test_utils::{record_at, BackupKind, BackupStatus, Frequency, RecordFilter, TestContext};

fn open(path: &std::path::Path) -> BackupRegistry {
    BackupRegistry::new(Arc::new(JsonFileRegistry::open(path).unwrap()))
}

#[test]
fn test_two_instances_see_each_other() {
    let ctx = TestContext::new();
    let path = ctx.temp_dir().join("state/registry.json");
    let first = open(&path);
    let second = open(&path);

    let record = record_at(
        "home-1",
        BackupKind::FileTree,
        Frequency::Daily,
        BackupStatus::Completed,
        Utc::now(),
        "/srv/store/home-1.zip",
    );
    first.create(record).unwrap();

    let seen = second.get("home-1").unwrap();
    assert_eq!(seen.status, BackupStatus::Completed);

    second.transition("home-1", BackupStatus::Verified).unwrap();
    assert_eq!(first.get("home-1").unwrap().status, BackupStatus::Verified);
}

#[test]
fn test_concurrent_updates_from_separate_instances() {
    let ctx = TestContext::new();
    let path = ctx.temp_dir().join("registry.json");
    open(&path)
        .create(record_at(
            "counter",
            BackupKind::FileTree,
            Frequency::Daily,
            BackupStatus::Completed,
            Utc::now(),
            "/srv/store/counter.zip",
        ))
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                let registry = open(&path);
                for _ in 0..10 {
                    registry
                        .update("counter", |record| {
                            record.size_bytes += 1;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // 1 from the fixture plus 40 increments
    assert_eq!(open(&path).get("counter").unwrap().size_bytes, 41);
}

#[test]
fn test_duplicate_location_is_refused_across_instances() {
    let ctx = TestContext::new();
    let path = ctx.temp_dir().join("registry.json");
    let first = open(&path);
    let second = open(&path);

    let now = Utc::now();
    first
        .create(record_at("a", BackupKind::Database, Frequency::Daily, BackupStatus::Completed, now, "/srv/a.sql"))
        .unwrap();
    let result = second.create(record_at(
        "b",
        BackupKind::Database,
        Frequency::Daily,
        BackupStatus::Completed,
        now,
        "/srv/a.sql",
    ));
    assert!(matches!(result, Err(RegistryError::DuplicateLocation(_))));
    assert!(first.find("b").unwrap().is_none());
}

#[test]
fn test_query_filters_and_orders() {
    let ctx = TestContext::new();
    let registry = open(&ctx.temp_dir().join("registry.json"));
    let now = Utc::now();

    for (i, status) in [
        BackupStatus::Verified,
        BackupStatus::Completed,
        BackupStatus::Failed,
        BackupStatus::Deleted,
    ]
    .into_iter()
    .enumerate()
    {
        let id = format!("db-{}", i);
        registry
            .create(record_at(
                &id,
                BackupKind::Database,
                Frequency::Daily,
                status,
                now - Duration::days(10 - i as i64),
                &format!("/srv/{}.sql", id),
            ))
            .unwrap();
    }
    registry
        .create(record_at(
            "home-0",
            BackupKind::FileTree,
            Frequency::Daily,
            BackupStatus::Verified,
            now - Duration::days(20),
            "/srv/home-0.zip",
        ))
        .unwrap();

    let retained = registry
        .query(
            &RecordFilter::new()
                .kind(BackupKind::Database)
                .status(BackupStatus::Completed)
                .status(BackupStatus::Verified),
        )
        .unwrap();
    let ids: Vec<_> = retained.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["db-0", "db-1"]);

    let old = registry
        .query(&RecordFilter::new().created_before(now - Duration::days(9)))
        .unwrap();
    let ids: Vec<_> = old.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["home-0", "db-0"]);
}

#[test]
fn test_registry_file_is_json() {
    let ctx = TestContext::new();
    let path = ctx.temp_dir().join("registry.json");
    open(&path)
        .create(record_at(
            "cfg-1",
            BackupKind::ConfigSnapshot,
            Frequency::Weekly,
            BackupStatus::Verified,
            Utc::now(),
            "/srv/cfg-1.json",
        ))
        .unwrap();

    let document: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(document["version"], 1);
    assert_eq!(document["records"][0]["id"], "cfg-1");
    assert_eq!(document["records"][0]["status"], "verified");
    assert_eq!(document["records"][0]["kind"], "config_snapshot");
}
