//! Orchestrators that compose capturers, transforms, storage and the registry

pub mod backup;
pub mod logging;
pub mod notification;
pub mod restore;
pub mod retention;
pub mod verify;

use crate::config::BackupKind;
use crate::error::EngineError;
use crate::integrity::IntegrityVerifier;
use crate::registry::BackupRegistry;
use crate::storage::StorageRegistry;
use crate::strategies::{CapturerSet, SourceCapturer};
use crate::transform::TransformFactory;
use crate::utils::cancel::CancelToken;
use crate::utils::locker::RunLocks;
use crate::utils::workspace::RunWorkspace;
use notification::{dispatch, BackupEvent, EventReporter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Collaborators shared by every orchestrator of one engine
pub struct Services {
    /// Parent of per-run workspaces
    pub work_dir: PathBuf,
    pub registry: BackupRegistry,
    pub storage: StorageRegistry,
    pub capturers: CapturerSet,
    pub transforms: Arc<dyn TransformFactory>,
    pub verifier: IntegrityVerifier,
    pub reporter: Arc<dyn EventReporter>,
    pub locks: RunLocks,
    /// Runs taking longer than this raise a `LongRunning` event
    pub long_running_threshold: Option<Duration>,
    /// Upper bound on any single run, on top of the caller's token
    pub run_timeout: Option<Duration>,
}

impl Services {
    pub(crate) fn report(&self, event: BackupEvent) {
        dispatch(self.reporter.as_ref(), &event);
    }

    /// Fresh scoped directory for one run
    pub(crate) fn workspace(&self, label: &str) -> Result<RunWorkspace, EngineError> {
        RunWorkspace::create(&self.work_dir, label).map_err(|e| EngineError::workspace(&self.work_dir, e))
    }

    /// The caller's token, tightened by the engine-wide run timeout
    pub(crate) fn run_token(&self, cancel: &CancelToken) -> CancelToken {
        match self.run_timeout {
            Some(timeout) => cancel.child_with_timeout(timeout),
            None => cancel.clone(),
        }
    }

    pub(crate) fn capturer(&self, kind: BackupKind) -> Result<Arc<dyn SourceCapturer>, EngineError> {
        self.capturers
            .get(kind)
            .ok_or_else(|| EngineError::InvalidRequest(format!("no capturer registered for {} backups", kind)))
    }
}
