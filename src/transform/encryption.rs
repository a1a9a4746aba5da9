//! AES-256-GCM segmented stream encryption
//!
//! Output layout:
//!
//! ```text
//! header:  "DBBK" | version u8 | kdf u8 | m_cost u32 | t_cost u32 | p_cost u32
//!          | salt [16] | nonce prefix [7]
//! frames:  len u32 | ciphertext+tag        (repeated)
//! ```
//!
//! Plaintext is sealed in 64 KiB segments. Each nonce is
//! `prefix || counter (u32 BE) || last flag`, and the header is bound to
//! every segment as associated data. Only the final segment carries the
//! last flag, so truncating the artifact or reordering frames fails
//! authentication on decrypt. All integers are big-endian.

use super::StreamTransformer;
use crate::credentials::Secret;
use crate::error::{BackupError, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

pub(crate) const MAGIC: &[u8; 4] = b"DBBK";
pub(crate) const FORMAT_VERSION: u8 = 1;
pub(crate) const KDF_RAW: u8 = 0;
pub(crate) const KDF_ARGON2ID: u8 = 1;
pub(crate) const SALT_LEN: usize = 16;
pub(crate) const NONCE_PREFIX_LEN: usize = 7;
pub(crate) const HEADER_LEN: usize = 4 + 1 + 1 + 12 + SALT_LEN + NONCE_PREFIX_LEN;

/// Plaintext bytes per sealed segment
pub const SEGMENT_SIZE: usize = 64 * 1024;

const KEY_LEN: usize = 32;
const MIN_PASSPHRASE_LEN: usize = 8;
const RAW_KEY_PREFIX: &str = "base64:";

/// Argon2id cost parameters recorded in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

pub(crate) fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let argon_params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| BackupError::Encryption(format!("Invalid key derivation parameters: {}", e)))?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| BackupError::Encryption(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

pub(crate) fn segment_nonce(prefix: &[u8], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = u8::from(last);
    nonce
}

pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
    header: Vec<u8>,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    buffer: Vec<u8>,
    header_written: bool,
    finished: bool,
}

impl AesGcmEncryptor {
    /// Accepts either a passphrase (at least 8 characters, stretched with
    /// Argon2id) or a raw key written as `base64:<32 bytes>`.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        Self::from_secret_with_params(secret, KdfParams::default())
    }

    pub fn from_secret_with_params(secret: &Secret, params: KdfParams) -> Result<Self> {
        let material = secret.expose().trim();
        if material.is_empty() {
            return Err(BackupError::Encryption("Encryption key is empty".to_string()));
        }

        let mut salt = [0u8; SALT_LEN];
        let (kdf, key, params) = match material.strip_prefix(RAW_KEY_PREFIX) {
            Some(encoded) => {
                let bytes = Zeroizing::new(STANDARD.decode(encoded).map_err(|e| {
                    BackupError::Encryption(format!("Invalid base64 encryption key: {}", e))
                })?);
                if bytes.len() != KEY_LEN {
                    return Err(BackupError::Encryption(format!(
                        "Raw encryption key must be {} bytes, got {}",
                        KEY_LEN,
                        bytes.len()
                    )));
                }
                let mut key = Zeroizing::new([0u8; KEY_LEN]);
                key.copy_from_slice(&bytes);
                let none = KdfParams {
                    memory_kib: 0,
                    time_cost: 0,
                    parallelism: 0,
                };
                (KDF_RAW, key, none)
            }
            None => {
                if material.chars().count() < MIN_PASSPHRASE_LEN {
                    return Err(BackupError::Encryption(format!(
                        "Encryption passphrase must be at least {} characters",
                        MIN_PASSPHRASE_LEN
                    )));
                }
                OsRng.fill_bytes(&mut salt);
                (KDF_ARGON2ID, derive_key(material.as_bytes(), &salt, params)?, params)
            }
        };

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| BackupError::Encryption(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut nonce_prefix);

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.push(FORMAT_VERSION);
        header.push(kdf);
        header.extend_from_slice(&params.memory_kib.to_be_bytes());
        header.extend_from_slice(&params.time_cost.to_be_bytes());
        header.extend_from_slice(&params.parallelism.to_be_bytes());
        header.extend_from_slice(&salt);
        header.extend_from_slice(&nonce_prefix);

        Ok(Self {
            cipher,
            header,
            nonce_prefix,
            counter: 0,
            buffer: Vec::with_capacity(SEGMENT_SIZE),
            header_written: false,
            finished: false,
        })
    }

    fn seal(&mut self, segment: &[u8], last: bool, out: &mut Vec<u8>) -> Result<()> {
        if self.counter == u32::MAX {
            return Err(BackupError::Encryption(
                "Artifact too large for one encryption stream".to_string(),
            ));
        }
        let nonce = segment_nonce(&self.nonce_prefix, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: segment,
                    aad: &self.header,
                },
            )
            .map_err(|e| BackupError::Encryption(format!("Encryption failed: {}", e)))?;

        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        out.extend_from_slice(&sealed);
        self.counter += 1;
        Ok(())
    }

    fn take_header(&mut self, out: &mut Vec<u8>) {
        if !self.header_written {
            out.extend_from_slice(&self.header);
            self.header_written = true;
        }
    }
}

impl StreamTransformer for AesGcmEncryptor {
    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn extension(&self) -> &'static str {
        "enc"
    }

    fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        if self.finished {
            return Err(BackupError::Encryption(
                "Encryption stage used after finish".to_string(),
            ));
        }
        let mut out = Vec::new();
        self.take_header(&mut out);
        self.buffer.extend_from_slice(chunk);

        // keep at least one byte back so the final segment is never empty
        // unless the whole stream is
        while self.buffer.len() > SEGMENT_SIZE {
            let segment: Vec<u8> = self.buffer.drain(..SEGMENT_SIZE).collect();
            self.seal(&segment, false, &mut out)?;
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        if self.finished {
            return Err(BackupError::Encryption(
                "Encryption stage finished twice".to_string(),
            ));
        }
        let mut out = Vec::new();
        self.take_header(&mut out);
        let segment = std::mem::take(&mut self.buffer);
        self.seal(&segment, true, &mut out)?;
        self.finished = true;
        Ok(out)
    }
}
