//! Encryption key material and the providers that supply it
//!
//! Keys are held in zeroizing buffers and never printed; the engine asks a
//! `SecretProvider` for the current key each time it needs one, so rotation
//! stays the provider's business.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Length of an AES-256 key in bytes
pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("failed to read key file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key is not valid base64")]
    Encoding,

    #[error("key must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("environment variable '{0}' is not set")]
    MissingEnv(String),

    #[error("no encryption key configured")]
    NotConfigured,
}

/// A 256-bit symmetric key, zeroed on drop
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a key from a slice, which must be exactly `KEY_LEN` bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SecretError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| SecretError::Length {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self::from_bytes(array))
    }

    /// Decode a base64 key, ignoring surrounding whitespace
    pub fn from_base64(encoded: &str) -> Result<Self, SecretError> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| SecretError::Encoding)?,
        );
        Self::from_slice(&decoded)
    }

    /// Generate a random key
    pub fn generate() -> Self {
        use aes_gcm::aead::rand_core::RngCore;
        use aes_gcm::aead::OsRng;

        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    /// Base64 encoding, for writing a freshly generated key file
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(&self.0[..]))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Source of the current encryption key
pub trait SecretProvider: Send + Sync {
    fn encryption_key(&self) -> Result<EncryptionKey, SecretError>;
}

/// Reads a base64-encoded key from a file on every call
#[derive(Debug, Clone)]
pub struct KeyFileProvider {
    path: PathBuf,
}

impl KeyFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretProvider for KeyFileProvider {
    fn encryption_key(&self) -> Result<EncryptionKey, SecretError> {
        let contents = Zeroizing::new(fs::read_to_string(&self.path).map_err(|source| {
            SecretError::Read {
                path: self.path.clone(),
                source,
            }
        })?);
        EncryptionKey::from_base64(&contents)
    }
}

/// Reads a base64-encoded key from an environment variable
#[derive(Debug, Clone)]
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl SecretProvider for EnvKeyProvider {
    fn encryption_key(&self) -> Result<EncryptionKey, SecretError> {
        let value = Zeroizing::new(
            std::env::var(&self.var).map_err(|_| SecretError::MissingEnv(self.var.clone()))?,
        );
        EncryptionKey::from_base64(&value)
    }
}

/// Fixed key held in memory (tests and embedding callers)
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: EncryptionKey,
}

impl StaticKeyProvider {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }
}

impl SecretProvider for StaticKeyProvider {
    fn encryption_key(&self) -> Result<EncryptionKey, SecretError> {
        Ok(self.key.clone())
    }
}

/// Provider used when no key is configured; every request fails
#[derive(Debug, Clone, Default)]
pub struct NoKeyProvider;

impl SecretProvider for NoKeyProvider {
    fn encryption_key(&self) -> Result<EncryptionKey, SecretError> {
        Err(SecretError::NotConfigured)
    }
}
