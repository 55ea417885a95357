//! Scoped temporary directory for a single backup or restore run

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Temporary directory owned by exactly one run.
///
/// The directory and everything in it is removed when the workspace is
/// dropped, whether the run succeeded, failed, was cancelled or panicked.
pub struct RunWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl RunWorkspace {
    /// Create a fresh directory under `parent` named after the run
    pub fn create(parent: &Path, label: &str) -> io::Result<Self> {
        fs::create_dir_all(parent)?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize_label(label)))
            .tempdir_in(parent)?;
        let path = dir.path().to_path_buf();

        debug!("Created run workspace: {:?}", path);

        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path for a file inside the workspace
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Whether `candidate` lives inside this workspace
    pub fn contains(&self, candidate: &Path) -> bool {
        candidate.starts_with(&self.path)
    }

}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!("Removed run workspace: {:?}", self.path),
                Err(e) => warn!("Failed to remove run workspace {:?}: {}", self.path, e),
            }
        }
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
