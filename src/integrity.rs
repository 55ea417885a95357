//! Content checksums tagged with their algorithm
//!
//! Checksums are stored as `<algorithm>:<lowercase hex>`. Only `sha256` is
//! produced today; the tag lets a later algorithm coexist with old records.
//! Verification never falls back to another algorithm or a weaker comparison.

use crate::utils::cancel::{CancelToken, Cancelled};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Algorithm used for every new checksum
pub const CURRENT_ALGORITHM: ChecksumAlgorithm = ChecksumAlgorithm::Sha256;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unsupported checksum algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("malformed checksum '{0}'")]
    Malformed(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("record has no {0} checksum")]
    MissingChecksum(&'static str),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn tag(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
        }
    }
}

/// A parsed, algorithm-tagged checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl Checksum {
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.tag(), self.hex)
    }
}

impl FromStr for Checksum {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, hex) = s
            .split_once(':')
            .ok_or_else(|| IntegrityError::Malformed(s.to_string()))?;

        let algorithm = match tag {
            "sha256" => ChecksumAlgorithm::Sha256,
            other => return Err(IntegrityError::UnsupportedAlgorithm(other.to_string())),
        };

        let valid = hex.len() == algorithm.hex_len()
            && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
        if !valid {
            return Err(IntegrityError::Malformed(s.to_string()));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

/// Checksum plus byte count of one file, computed in a single pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub checksum: String,
    pub size_bytes: u64,
}

/// Computes and compares content checksums
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Checksum of the file at `path` with the current algorithm
    pub fn checksum(&self, path: &Path, cancel: &CancelToken) -> Result<String, IntegrityError> {
        Ok(self.digest(path, cancel)?.checksum)
    }

    /// Checksum and size of the file at `path`
    pub fn digest(&self, path: &Path, cancel: &CancelToken) -> Result<FileDigest, IntegrityError> {
        let file = File::open(path).map_err(|source| IntegrityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (hex, size_bytes) = sha256_reader(BufReader::new(file), cancel).map_err(|e| match e {
            HashError::Io(source) => IntegrityError::Io {
                path: path.to_path_buf(),
                source,
            },
            HashError::Cancelled(reason) => IntegrityError::Cancelled(reason),
        })?;

        Ok(FileDigest {
            checksum: format!("{}:{}", CURRENT_ALGORITHM.tag(), hex),
            size_bytes,
        })
    }

    /// Whether the file's content matches `expected`.
    ///
    /// The file is hashed with the algorithm named in `expected`; an unknown
    /// or malformed tag is an error, not a mismatch.
    pub fn verify(
        &self,
        path: &Path,
        expected: &str,
        cancel: &CancelToken,
    ) -> Result<bool, IntegrityError> {
        let expected: Checksum = expected.parse()?;
        let actual: Checksum = match expected.algorithm() {
            ChecksumAlgorithm::Sha256 => self.checksum(path, cancel)?.parse()?,
        };
        Ok(actual == expected)
    }

    /// Like `verify`, but a mismatch is an `IntegrityError::Mismatch`
    pub fn ensure(
        &self,
        path: &Path,
        expected: &str,
        cancel: &CancelToken,
    ) -> Result<String, IntegrityError> {
        expected.parse::<Checksum>()?;
        let actual = self.checksum(path, cancel)?;
        if actual != expected {
            return Err(IntegrityError::Mismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(actual)
    }
}

/// Checksum of an in-memory buffer
pub fn checksum_bytes(data: &[u8]) -> String {
    format!("{}:{}", CURRENT_ALGORITHM.tag(), hex::encode(Sha256::digest(data)))
}

enum HashError {
    Io(io::Error),
    Cancelled(Cancelled),
}

fn sha256_reader<R: Read>(mut reader: R, cancel: &CancelToken) -> Result<(String, u64), HashError> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        cancel.check().map_err(HashError::Cancelled)?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HashError::Io(e)),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}
