//! AES-256-GCM encryption of whole artifacts
//!
//! The artifact is split into 64 KiB plaintext chunks, each sealed separately
//! so files of any size stream through constant memory. Layout:
//!
//! ```text
//! header:  "BKENC1" | version (1 byte) | nonce prefix (7 bytes)
//! chunk i: AES-256-GCM(key, nonce = prefix | i as u32 BE | last flag, aad = header)
//! ```
//!
//! A chunk shorter than the chunk size is the final one and carries the last
//! flag, so input that is an exact multiple of the chunk size ends with an
//! empty final chunk. Dropped, reordered, truncated or appended chunks all
//! fail authentication.

use super::{discard_partial, forward_output, inverse_output, StageKind, TransformError, TransformStage};
use crate::secrets::EncryptionKey;
use crate::utils::cancel::CancelToken;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

const STAGE: &str = "encrypt";

const MAGIC: &[u8; 6] = b"BKENC1";
const VERSION: u8 = 1;
const PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = MAGIC.len() + 1 + PREFIX_LEN;
const TAG_LEN: usize = 16;

/// Plaintext bytes per sealed chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Authenticated encryption stage
#[derive(Debug, Clone)]
pub struct Encryptor {
    key: EncryptionKey,
}

impl Encryptor {
    pub const ALGORITHM: &'static str = "aes-256-gcm-stream";

    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm, TransformError> {
        Aes256Gcm::new_from_slice(self.key.as_bytes())
            .map_err(|e| TransformError::Encryption(format!("Failed to create cipher: {}", e)))
    }

    fn encrypt_file(&self, input: &Path, output: &Path, cancel: &CancelToken) -> Result<u64, TransformError> {
        let cipher = self.cipher()?;
        let mut reader = BufReader::new(File::open(input).map_err(|e| TransformError::io(STAGE, input, e))?);
        let mut writer = BufWriter::new(File::create(output).map_err(|e| TransformError::io(STAGE, output, e))?);

        let mut header = [0u8; HEADER_LEN];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[MAGIC.len()] = VERSION;
        let mut prefix = [0u8; PREFIX_LEN];
        OsRng.fill_bytes(&mut prefix);
        header[MAGIC.len() + 1..].copy_from_slice(&prefix);
        writer.write_all(&header).map_err(|e| TransformError::io(STAGE, output, e))?;

        let mut buf = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
        let mut counter: u32 = 0;
        let mut total = 0u64;

        loop {
            cancel.check()?;
            let n = read_full(&mut reader, &mut buf).map_err(|e| TransformError::io(STAGE, input, e))?;
            let last = n < CHUNK_SIZE;

            let nonce = chunk_nonce(&prefix, counter, last);
            let sealed = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &buf[..n],
                        aad: &header,
                    },
                )
                .map_err(|e| TransformError::Encryption(format!("Encryption failed: {}", e)))?;
            writer.write_all(&sealed).map_err(|e| TransformError::io(STAGE, output, e))?;
            total += n as u64;

            if last {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| TransformError::Encryption("artifact too large".to_string()))?;
        }

        writer.flush().map_err(|e| TransformError::io(STAGE, output, e))?;
        Ok(total)
    }

    fn decrypt_file(&self, input: &Path, output: &Path, cancel: &CancelToken) -> Result<u64, TransformError> {
        let cipher = self.cipher()?;
        let mut reader = BufReader::new(File::open(input).map_err(|e| TransformError::io(STAGE, input, e))?);

        let mut header = [0u8; HEADER_LEN];
        let n = read_full(&mut reader, &mut header).map_err(|e| TransformError::io(STAGE, input, e))?;
        if n < HEADER_LEN || &header[..MAGIC.len()] != MAGIC {
            return Err(TransformError::Decryption("not an encrypted artifact".to_string()));
        }
        if header[MAGIC.len()] != VERSION {
            return Err(TransformError::Decryption(format!(
                "unsupported format version {}",
                header[MAGIC.len()]
            )));
        }
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&header[MAGIC.len() + 1..]);

        let mut writer = BufWriter::new(File::create(output).map_err(|e| TransformError::io(STAGE, output, e))?);
        let mut buf = vec![0u8; CHUNK_SIZE + TAG_LEN];
        let mut counter: u32 = 0;
        let mut total = 0u64;

        loop {
            cancel.check()?;
            let n = read_full(&mut reader, &mut buf).map_err(|e| TransformError::io(STAGE, input, e))?;
            let last = n < buf.len();
            if n < TAG_LEN {
                return Err(TransformError::Decryption("ciphertext truncated".to_string()));
            }

            let nonce = chunk_nonce(&prefix, counter, last);
            let plain = Zeroizing::new(
                cipher
                    .decrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: &buf[..n],
                            aad: &header,
                        },
                    )
                    .map_err(|_| {
                        TransformError::Decryption(
                            "authentication failed (wrong key or tampered data)".to_string(),
                        )
                    })?,
            );
            writer.write_all(&plain).map_err(|e| TransformError::io(STAGE, output, e))?;
            total += plain.len() as u64;

            if last {
                break;
            }
            counter = counter
                .checked_add(1)
                .ok_or_else(|| TransformError::Decryption("too many chunks".to_string()))?;
        }

        writer.flush().map_err(|e| TransformError::io(STAGE, output, e))?;
        Ok(total)
    }
}

impl TransformStage for Encryptor {
    fn kind(&self) -> StageKind {
        StageKind::Encrypt
    }

    fn algorithm(&self) -> &'static str {
        Self::ALGORITHM
    }

    fn extension(&self) -> &'static str {
        "enc"
    }

    fn apply(&self, input: &Path, out_dir: &Path, cancel: &CancelToken) -> Result<PathBuf, TransformError> {
        let output = forward_output(input, out_dir, self.extension());
        match self.encrypt_file(input, &output, cancel) {
            Ok(bytes) => {
                debug!("Encrypted {} bytes into {:?}", bytes, output);
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
        match self.decrypt_file(input, &output, cancel) {
            Ok(bytes) => {
                debug!("Decrypted {:?} into {} bytes", input, bytes);
                Ok(output)
            }
            Err(e) => {
                discard_partial(&output);
                Err(e)
            }
        }
    }
}

fn chunk_nonce(prefix: &[u8; PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..PREFIX_LEN].copy_from_slice(prefix);
    nonce[PREFIX_LEN..PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

/// Fill `buf` as far as the reader allows; a short count means end of input
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
