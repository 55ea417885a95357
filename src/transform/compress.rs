use super::{discard_partial, forward_output, inverse_output, StageKind, TransformError, TransformStage};
use crate::utils::cancel::{copy_cancellable, CancelToken};
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const STAGE: &str = "compress";

/// Single-stream bzip2 compression
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: u32,
}

impl Compressor {
    pub const ALGORITHM: &'static str = "bzip2";

    /// `level` is clamped to bzip2's 1..=9 range
    pub fn new(level: u32) -> Self {
        Self {
            level: level.clamp(1, 9),
        }
    }

    fn compress(&self, input: &Path, output: &Path, cancel: &CancelToken) -> Result<u64, TransformError> {
        let source = File::open(input).map_err(|e| TransformError::io(STAGE, input, e))?;
        let target = File::create(output).map_err(|e| TransformError::io(STAGE, output, e))?;

        let mut encoder = BzEncoder::new(BufWriter::new(target), Compression::new(self.level));
        let copied = copy_cancellable(&mut BufReader::new(source), &mut encoder, cancel)
            .map_err(|e| TransformError::stream(STAGE, output, e))?;

        encoder
            .finish()
            .and_then(|mut inner| inner.flush())
            .map_err(|e| TransformError::io(STAGE, output, e))?;
        Ok(copied)
    }

    fn decompress(&self, input: &Path, output: &Path, cancel: &CancelToken) -> Result<u64, TransformError> {
        let source = File::open(input).map_err(|e| TransformError::io(STAGE, input, e))?;
        let target = File::create(output).map_err(|e| TransformError::io(STAGE, output, e))?;

        let mut decoder = BzDecoder::new(BufReader::new(source));
        let mut writer = BufWriter::new(target);
        copy_cancellable(&mut decoder, &mut writer, cancel)
            .map_err(|e| TransformError::stream(STAGE, input, e))
    }
}

impl TransformStage for Compressor {
    fn kind(&self) -> StageKind {
        StageKind::Compress
    }

    fn algorithm(&self) -> &'static str {
        Self::ALGORITHM
    }

    fn extension(&self) -> &'static str {
        "bz2"
    }

    fn apply(&self, input: &Path, out_dir: &Path, cancel: &CancelToken) -> Result<PathBuf, TransformError> {
        let output = forward_output(input, out_dir, self.extension());
        match self.compress(input, &output, cancel) {
            Ok(bytes) => {
                debug!("Compressed {} bytes into {:?}", bytes, output);
                Ok(output)
            }
            Err(e) => {
                discard_partial(&output);
                Err(e)
            }
        }
    }

    fn invert(&self, input: &Path, out_dir: &Path, cancel: &CancelToken) -> Result<PathBuf, TransformError> {
        let output = inverse_output(input, out_dir, self.extension());
        match self.decompress(input, &output, cancel) {
            Ok(bytes) => {
                debug!("Decompressed {:?} into {} bytes", input, bytes);
                Ok(output)
            }
            Err(e) => {
                discard_partial(&output);
                Err(e)
            }
        }
    }
}
