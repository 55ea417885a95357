//! Reversible byte-stream transforms applied between capture and storage
//!
//! Stages run in forward order on backup (compress, then encrypt) and in
//! reverse order on restore. Encryption is always the last forward stage;
//! `TransformPipeline::new` rejects any other arrangement.

pub mod compress;
pub mod encrypt;

pub use compress::Compressor;
pub use encrypt::Encryptor;

use crate::secrets::{SecretError, SecretProvider};
use crate::utils::cancel::{CancelToken, Cancelled, StreamError};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Separator of stage names in the recorded transform list
const NAME_SEPARATOR: char = ',';

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("{stage}: I/O error on {path:?}: {source}")]
    Io {
        stage: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption key unavailable: {0}")]
    Key(#[from] SecretError),

    #[error("unknown transform stage '{0}'")]
    UnknownStage(String),

    #[error("invalid transform order: {0}")]
    InvalidOrder(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl TransformError {
    pub(crate) fn io(stage: &'static str, path: &Path, source: io::Error) -> Self {
        TransformError::Io {
            stage,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn stream(stage: &'static str, path: &Path, err: StreamError) -> Self {
        match err {
            StreamError::Io(source) => Self::io(stage, path, source),
            StreamError::Cancelled(reason) => TransformError::Cancelled(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Compress,
    Encrypt,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Compress => "compress",
            StageKind::Encrypt => "encrypt",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One reversible transform.
///
/// `apply` and `invert` write a new file into `out_dir` and return its path.
/// They never modify their input, and remove any partial output before
/// returning an error.
pub trait TransformStage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Algorithm identifier recorded in backup metadata
    fn algorithm(&self) -> &'static str;

    /// File extension appended by `apply`
    fn extension(&self) -> &'static str;

    fn apply(&self, input: &Path, out_dir: &Path, cancel: &CancelToken) -> Result<PathBuf, TransformError>;

    fn invert(&self, input: &Path, out_dir: &Path, cancel: &CancelToken) -> Result<PathBuf, TransformError>;
}

/// Output path of a forward stage: input name plus the stage extension
pub(crate) fn forward_output(input: &Path, out_dir: &Path, extension: &str) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    out_dir.join(format!("{}.{}", name, extension))
}

/// Output path of an inverse stage: input name without the stage extension
pub(crate) fn inverse_output(input: &Path, out_dir: &Path, extension: &str) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let suffix = format!(".{}", extension);
    match name.strip_suffix(suffix.as_str()) {
        Some(stripped) if !stripped.is_empty() => out_dir.join(stripped),
        _ => out_dir.join(format!("{}.{}-inverted", name, extension)),
    }
}

/// Remove a partially written output, logging rather than failing
pub(crate) fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial output {:?}: {}", path, e);
        }
    }
}

/// Builds transform stages; swapped out in tests to inject failures
pub trait TransformFactory: Send + Sync {
    fn compressor(&self) -> Result<Box<dyn TransformStage>, TransformError>;

    fn encryptor(&self) -> Result<Box<dyn TransformStage>, TransformError>;

    fn stage(&self, kind: StageKind) -> Result<Box<dyn TransformStage>, TransformError> {
        match kind {
            StageKind::Compress => self.compressor(),
            StageKind::Encrypt => self.encryptor(),
        }
    }
}

/// bzip2 compression and AES-256-GCM encryption keyed by a secret provider
pub struct StandardTransforms {
    compression_level: u32,
    secrets: Arc<dyn SecretProvider>,
}

impl StandardTransforms {
    pub fn new(compression_level: u32, secrets: Arc<dyn SecretProvider>) -> Self {
        Self {
            compression_level,
            secrets,
        }
    }
}

impl TransformFactory for StandardTransforms {
    fn compressor(&self) -> Result<Box<dyn TransformStage>, TransformError> {
        Ok(Box::new(Compressor::new(self.compression_level)))
    }

    fn encryptor(&self) -> Result<Box<dyn TransformStage>, TransformError> {
        let key = self.secrets.encryption_key()?;
        Ok(Box::new(Encryptor::new(key)))
    }
}

/// An ordered list of stages
pub struct TransformPipeline {
    stages: Vec<Box<dyn TransformStage>>,
}

impl TransformPipeline {
    /// Pipeline from stages in forward order
    pub fn new(stages: Vec<Box<dyn TransformStage>>) -> Result<Self, TransformError> {
        let kinds: Vec<StageKind> = stages.iter().map(|s| s.kind()).collect();
        for (i, kind) in kinds.iter().enumerate() {
            if kinds[..i].contains(kind) {
                return Err(TransformError::InvalidOrder(format!("'{}' appears twice", kind)));
            }
            if *kind == StageKind::Encrypt && i + 1 != kinds.len() {
                return Err(TransformError::InvalidOrder(
                    "encrypt must be the last forward stage".to_string(),
                ));
            }
        }
        Ok(Self { stages })
    }

    /// No-op pipeline
    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    /// Pipeline for a backup's `compress`/`encrypt` flags
    pub fn for_flags(
        factory: &dyn TransformFactory,
        compress: bool,
        encrypt: bool,
    ) -> Result<Self, TransformError> {
        let mut stages = Vec::new();
        if compress {
            stages.push(factory.compressor()?);
        }
        if encrypt {
            stages.push(factory.encryptor()?);
        }
        Self::new(stages)
    }

    /// Pipeline from a recorded forward order such as `compress,encrypt`
    pub fn from_names(factory: &dyn TransformFactory, names: &str) -> Result<Self, TransformError> {
        let stages = parse_names(names)?
            .into_iter()
            .map(|kind| factory.stage(kind))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stages)
    }

    /// Forward order as recorded in metadata; empty for no stages
    pub fn names(&self) -> String {
        self.stages
            .iter()
            .map(|s| s.kind().name())
            .collect::<Vec<_>>()
            .join(&NAME_SEPARATOR.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> impl Iterator<Item = &dyn TransformStage> {
        self.stages.iter().map(|s| s.as_ref())
    }

    /// Combined extension of the forward output, e.g. `.bz2.enc`
    pub fn extension(&self) -> String {
        self.stages
            .iter()
            .map(|s| format!(".{}", s.extension()))
            .collect()
    }

    /// Apply every stage in forward order.
    ///
    /// Each intermediate file is deleted as soon as the next stage has
    /// consumed it. `input` itself is deleted only when `consume_input` is set.
    pub fn forward(
        &self,
        input: &Path,
        work_dir: &Path,
        consume_input: bool,
        cancel: &CancelToken,
    ) -> Result<PathBuf, TransformError> {
        let order = self.stages.iter();
        self.run(input, consume_input, cancel, order, |stage, current| {
            stage.apply(current, work_dir, cancel)
        })
    }

    /// Apply every stage's inverse in reverse order
    pub fn inverse(
        &self,
        input: &Path,
        work_dir: &Path,
        consume_input: bool,
        cancel: &CancelToken,
    ) -> Result<PathBuf, TransformError> {
        let order = self.stages.iter().rev();
        self.run(input, consume_input, cancel, order, |stage, current| {
            stage.invert(current, work_dir, cancel)
        })
    }

    fn run<'a, I, F>(
        &self,
        input: &Path,
        consume_input: bool,
        cancel: &CancelToken,
        order: I,
        step: F,
    ) -> Result<PathBuf, TransformError>
    where
        F: Fn(&dyn TransformStage, &Path) -> Result<PathBuf, TransformError>,
        I: Iterator<Item = &'a Box<dyn TransformStage>>,
    {
        let mut current = input.to_path_buf();

        for stage in order {
            cancel.check()?;
            let output = step(stage.as_ref(), &current)?;
            debug!("{} produced {:?}", stage.kind(), output);

            if current != input || consume_input {
                discard_partial(&current);
            }
            current = output;
        }

        Ok(current)
    }
}

fn parse_names(names: &str) -> Result<Vec<StageKind>, TransformError> {
    names
        .split(NAME_SEPARATOR)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| match n {
            "compress" => Ok(StageKind::Compress),
            "encrypt" => Ok(StageKind::Encrypt),
            other => Err(TransformError::UnknownStage(other.to_string())),
        })
        .collect()
}
