//! Unit tests for backup-engine
//!
//! These tests exercise individual components without running whole backups.

mod config;
mod registry;
mod transforms;
