// Client-side encryption engine.
//
// One AES-256-GCM primitive shared by both wire formats:
// - single-blob format for small files (`IV ‖ ciphertext`)
// - chunked self-describing format for everything else (`format` module)
//
// Each encrypt call draws a fresh random IV. Keys are 256-bit, handed in as
// hex the same way the host stores them.

pub mod chunker;
pub mod format;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use thiserror::Error;

/// AES-GCM IV length in bytes.
pub const IV_SIZE: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;
/// Plaintext chunk size chosen so `IV + chunk + TAG` is exactly 1 MiB,
/// keeping every full encrypted chunk 256 KiB-aligned for resumable uploads.
pub const OPTIMAL_PLAINTEXT_CHUNK: usize = 1024 * 1024 - IV_SIZE - TAG_SIZE;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key management error: {0}")]
    KeyManagement(String),
    #[error("Encryption failed: {0}")]
    Encryption(String),
    /// Structural problem: bad magic, bad header fields, truncation.
    #[error("Ciphertext format error: {reason}")]
    Format {
        reason: String,
        chunk_index: Option<u32>,
    },
    /// GCM tag verification failed: wrong password or tampered content.
    #[error("Decryption failed — wrong password or tampered content")]
    Authentication { chunk_index: Option<u32> },
}

impl CryptoError {
    fn format(reason: impl Into<String>) -> Self {
        CryptoError::Format {
            reason: reason.into(),
            chunk_index: None,
        }
    }

    /// The chunk a chunked-format decryption failed on, when known.
    pub fn chunk_index(&self) -> Option<u32> {
        match self {
            CryptoError::Format { chunk_index, .. } => *chunk_index,
            CryptoError::Authentication { chunk_index } => *chunk_index,
            _ => None,
        }
    }

    fn at_chunk(self, index: u32) -> Self {
        match self {
            CryptoError::Format { reason, .. } => CryptoError::Format {
                reason,
                chunk_index: Some(index),
            },
            CryptoError::Authentication { .. } => CryptoError::Authentication {
                chunk_index: Some(index),
            },
            other => other,
        }
    }
}

/// AES-256-GCM engine shared by both wire formats.
#[derive(Clone)]
pub struct EncryptionEngine {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionEngine")
            .field("cipher", &"<initialized>")
            .finish()
    }
}

impl EncryptionEngine {
    /// Build an engine from a hex-encoded 256-bit key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self, CryptoError> {
        let key_bytes = hex::decode(key_hex)
            .map_err(|e| CryptoError::KeyManagement(format!("Invalid key format: {e}")))?;
        if key_bytes.len() != 32 {
            return Err(CryptoError::KeyManagement(
                "Invalid key length, expected 32 bytes".to_string(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(EncryptionEngine {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Generate a fresh random vault key, hex-encoded.
    pub fn generate_key_hex() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        hex::encode(key.as_slice())
    }

    pub fn iv_size(&self) -> usize {
        IV_SIZE
    }

    pub fn tag_size(&self) -> usize {
        TAG_SIZE
    }

    pub fn optimal_chunk_size(&self) -> usize {
        OPTIMAL_PLAINTEXT_CHUNK
    }

    /// Encrypt with a fresh random IV. Returns `(iv, ciphertext)`; the
    /// ciphertext carries the GCM tag at its end.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let iv = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&iv, plaintext)
            .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {e}")))?;
        Ok((iv.to_vec(), ciphertext))
    }

    /// Decrypt one `(ciphertext, iv)` pair.
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if iv.len() != IV_SIZE {
            return Err(CryptoError::format(format!(
                "invalid IV length {}, expected {IV_SIZE}",
                iv.len()
            )));
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::format(format!(
                "ciphertext of {} bytes cannot carry a GCM tag",
                ciphertext.len()
            )));
        }
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::Authentication { chunk_index: None })
    }
}
