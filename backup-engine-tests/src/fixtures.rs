//! Test fixtures and sample data
//!
//! Provides pre-built trees, user data and records for testing.

use backup_engine::config::{BackupConfig, BackupKind, Frequency, StorageProvider};
use backup_engine::registry::{keys, BackupRecord, BackupStatus};
use backup_engine::secrets::EncryptionKey;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

/// Write a small project tree under `root`:
///
/// ```text
/// app/config.toml
/// app/data/records.csv
/// app/logs/today.log
/// media/logo.png
/// ```
pub fn sample_tree(root: &Path) {
    let files: [(&str, &[u8]); 4] = [
        ("app/config.toml", b"[server]\nport = 8080\n"),
        ("app/data/records.csv", b"id,name\n1,alpha\n2,bravo\n"),
        ("app/logs/today.log", b"started\nstopped\n"),
        ("media/logo.png", &[0x89, b'P', b'N', b'G', 0, 1, 2, 3]),
    ];
    for (name, content) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create fixture directory");
        }
        fs::write(&path, content).expect("Failed to write fixture file");
    }
}

/// Users, projects and documents for user-data exports
pub fn sample_user_data() -> Vec<(&'static str, Vec<Value>)> {
    vec![
        (
            "users",
            vec![
                json!({"id": 1, "name": "Ada", "role": "mentor"}),
                json!({"id": 2, "name": "Linus", "role": "student"}),
            ],
        ),
        (
            "projects",
            vec![json!({"id": 10, "title": "Compiler", "owner": 1})],
        ),
        (
            "documents",
            vec![
                json!({"id": 100, "project": 10, "body": "lexer notes"}),
                json!({"id": 101, "project": 10, "body": "parser notes"}),
            ],
        ),
    ]
}

/// Deterministic pseudo-random bytes
pub fn pseudo_random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Fixed key for encrypted test runs
pub fn test_key() -> EncryptionKey {
    EncryptionKey::from_bytes([7u8; 32])
}

/// A file tree job over `include`
pub fn file_tree_job(name: &str, include: &[&str]) -> BackupConfig {
    let mut config = BackupConfig::new(name, BackupKind::FileTree, StorageProvider::Local);
    config.frequency = Frequency::Daily;
    config.include_patterns = include.iter().map(|s| s.to_string()).collect();
    config
}

/// A settled record as the orchestrator would have written it
pub fn record_at(
    id: &str,
    kind: BackupKind,
    frequency: Frequency,
    status: BackupStatus,
    created_at: DateTime<Utc>,
    location_uri: &str,
) -> BackupRecord {
    let mut config = BackupConfig::new(id, kind, StorageProvider::Local);
    config.frequency = frequency;

    let mut record = BackupRecord::pending(id, &config, created_at);
    record.status = status;
    record.location_uri = Some(location_uri.to_string());
    record.size_bytes = 1;
    record.checksum = Some(format!("sha256:{}", "0".repeat(64)));
    record
        .metadata
        .insert(keys::TRANSFORMS.to_string(), String::new());
    record
}
