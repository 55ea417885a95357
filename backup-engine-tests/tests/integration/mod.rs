//! Integration tests for backup-engine
//!
//! Configuration-driven engines with database jobs. The mocked tests run
//! everywhere; the Docker ones are ignored by default.
//! Run the Docker tests with: `cargo test -p backup-engine-tests --test integration -- --ignored`

mod common;
mod database;
mod postgres;
