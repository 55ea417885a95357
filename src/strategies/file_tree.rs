//! File tree strategy
//!
//! Walks the include patterns (minus excludes) and writes a deterministic
//! ZIP archive of the matching files.

use super::{
    artifact_file_name, produce_or_discard, ApplyError, CaptureError, CapturedArtifact,
    RestoreTarget, SourceCapturer,
};
use crate::config::{BackupConfig, BackupKind};
use crate::utils::archive::{collect_entries, extract_archive, write_archive};
use crate::utils::cancel::CancelToken;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct FileTreeCapturer {
    source_root: PathBuf,
}

impl FileTreeCapturer {
    /// `source_root` anchors relative include patterns and entry names
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }
}

impl SourceCapturer for FileTreeCapturer {
    fn kind(&self) -> BackupKind {
        BackupKind::FileTree
    }

    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError> {
        if config.include_patterns.is_empty() {
            return Err(CaptureError::InvalidConfig(
                "file tree backups need at least one include pattern".to_string(),
            ));
        }

        let entries = collect_entries(
            &config.include_patterns,
            &config.exclude_patterns,
            &self.source_root,
        )?;
        if entries.is_empty() {
            return Err(CaptureError::NothingToCapture(format!(
                "no files matched {:?}",
                config.include_patterns
            )));
        }

        let output = work_dir.join(artifact_file_name(config, "zip"));
        let count = produce_or_discard(&output, || write_archive(&entries, &output, cancel))?;

        info!("Captured {} files for '{}'", count, config.name);
        Ok(CapturedArtifact::new(output).with_metadata("entry_count", count.to_string()))
    }

    fn restore(
        &self,
        artifact: &Path,
        target: &RestoreTarget,
        _work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), ApplyError> {
        let dir = target.require_dir(self.kind())?;
        let count = extract_archive(artifact, dir, cancel)?;
        info!("Restored {} files into {:?}", count, dir);
        Ok(())
    }
}
