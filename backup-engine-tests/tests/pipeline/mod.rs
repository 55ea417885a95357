//! Pipeline tests for backup-engine
//!
//! Each test runs whole backups, restores, sweeps or verifications against a
//! local store in a temporary directory, with mocked sources where a real
//! one would need external systems.

mod backup;
mod cleanup;
mod concurrency;
mod restore;
mod retention;
mod verify;
