//! Common utilities for integration tests
//!
//! This module provides cleanup guards and helper functions for integration tests.

use std::process::Command;

/// Guard that ensures Docker container cleanup on drop (even on panic)
pub struct ContainerGuard {
    name: String,
}

impl ContainerGuard {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // -v also removes the anonymous data volume
        let _ = Command::new("docker").args(["stop", &self.name]).output();
        let _ = Command::new("docker").args(["rm", "-v", &self.name]).output();
    }
}

/// Helper to check if Docker is available
pub fn is_docker_available() -> bool {
    Command::new("docker")
        .args(["ps"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Whether `program --version` runs on this host
pub fn has_program(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
