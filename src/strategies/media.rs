use super::{
    artifact_file_name, produce_or_discard, ApplyError, CaptureError, CapturedArtifact,
    RestoreTarget, SourceCapturer,
};
use crate::config::{BackupConfig, BackupKind};
use crate::utils::archive::{collect_entries, extract_archive, write_archive};
use crate::utils::cancel::CancelToken;
use std::path::{Path, PathBuf};
use tracing::info;

/// Archives configured media directories.
///
/// Unlike file tree backups, every include must name an existing directory;
/// a missing media directory fails the capture instead of being skipped.
pub struct MediaArchiveCapturer {
    source_root: PathBuf,
}

impl MediaArchiveCapturer {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }

    fn resolve(&self, include: &str) -> PathBuf {
        let path = Path::new(include);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source_root.join(path)
        }
    }
}

impl SourceCapturer for MediaArchiveCapturer {
    fn kind(&self) -> BackupKind {
        BackupKind::MediaArchive
    }

    fn capture(
        &self,
        config: &BackupConfig,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<CapturedArtifact, CaptureError> {
        if config.include_patterns.is_empty() {
            return Err(CaptureError::InvalidConfig(
                "media archives need at least one media directory".to_string(),
            ));
        }

        for include in &config.include_patterns {
            let dir = self.resolve(include);
            if !dir.is_dir() {
                return Err(CaptureError::SourceMissing(dir));
            }
        }

        let entries = collect_entries(
            &config.include_patterns,
            &config.exclude_patterns,
            &self.source_root,
        )?;
        if entries.is_empty() {
            return Err(CaptureError::NothingToCapture(format!(
                "media directories {:?} are empty",
                config.include_patterns
            )));
        }

        let output = work_dir.join(artifact_file_name(config, "zip"));
        let count = produce_or_discard(&output, || write_archive(&entries, &output, cancel))?;

        info!(
            "Archived {} media files from {} directories",
            count,
            config.include_patterns.len()
        );
        Ok(CapturedArtifact::new(output)
            .with_metadata("entry_count", count.to_string())
            .with_metadata("media_directories", config.include_patterns.join(",")))
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
        info!("Restored {} media files into {:?}", count, dir);
        Ok(())
    }
}
