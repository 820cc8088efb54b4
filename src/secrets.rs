// Secret storage for adapter credentials (OAuth tokens, wrapped keys).
//
// The engine only needs an opaque put/get/clear contract. The default
// implementation uses the system keychain; hosts without one fall back to a
// single encrypted file under the data root.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 150_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Secret blob is malformed")]
    Malformed,
    #[error("Secret blob decryption failed — wrong passphrase or corrupted file")]
    Decryption,
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Opaque secret storage contract.
pub trait SecretStore: Send + Sync {
    fn put(&self, id: &str, value: &str) -> Result<(), SecretError>;
    fn get(&self, id: &str) -> Result<Option<String>, SecretError>;
    fn clear(&self, id: &str) -> Result<(), SecretError>;
}

/// System keychain backed store, one keyring entry per secret id.
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: &str) -> Self {
        KeyringSecretStore {
            service: service.to_string(),
        }
    }

    fn entry(&self, id: &str) -> Result<keyring::Entry, SecretError> {
        Ok(keyring::Entry::new(&self.service, id)?)
    }
}

impl SecretStore for KeyringSecretStore {
    fn put(&self, id: &str, value: &str) -> Result<(), SecretError> {
        self.entry(id)?.set_password(value)?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<String>, SecretError> {
        match self.entry(id)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SecretError::Keyring(e)),
        }
    }

    fn clear(&self, id: &str) -> Result<(), SecretError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SecretError::Keyring(e)),
        }
    }
}

/// File-based fallback store.
///
/// All secrets live in one JSON map, encrypted as a single blob:
/// `salt (16) ‖ IV (12) ‖ AES-256-GCM ciphertext`. The key is derived from
/// the host-supplied passphrase with PBKDF2-HMAC-SHA256. A fresh salt and IV
/// are written on every save.
pub struct FileSecretStore {
    path: PathBuf,
    passphrase: String,
}

impl FileSecretStore {
    pub fn new(path: PathBuf, passphrase: &str) -> Self {
        FileSecretStore {
            path,
            passphrase: passphrase.to_string(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(self.passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        key
    }

    fn load_map(&self) -> Result<HashMap<String, String>, SecretError> {
        let blob = match std::fs::read(&self.path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        if blob.len() < SALT_LEN + IV_LEN {
            return Err(SecretError::Malformed);
        }
        let (salt, rest) = blob.split_at(SALT_LEN);
        let (iv, ciphertext) = rest.split_at(IV_LEN);

        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| SecretError::Decryption)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn save_map(&self, map: &HashMap<String, String>) -> Result<(), SecretError> {
        let plaintext = serde_json::to_vec(map)?;

        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let iv = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&iv, plaintext.as_slice())
            .map_err(|e| SecretError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staged = self.path.with_extension("tmp");
        std::fs::write(&staged, &blob)?;
        std::fs::rename(&staged, &self.path)?;
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn put(&self, id: &str, value: &str) -> Result<(), SecretError> {
        let mut map = self.load_map()?;
        map.insert(id.to_string(), value.to_string());
        self.save_map(&map)
    }

    fn get(&self, id: &str) -> Result<Option<String>, SecretError> {
        Ok(self.load_map()?.get(id).cloned())
    }

    fn clear(&self, id: &str) -> Result<(), SecretError> {
        let mut map = self.load_map()?;
        if map.remove(id).is_some() {
            self.save_map(&map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(dir: &tempfile::TempDir) -> FileSecretStore {
        FileSecretStore::new(dir.path().join(".sync-state"), "hunter2")
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);

        assert!(store.get("oauth_token").unwrap().is_none());
        store.put("oauth_token", "tok-123").unwrap();
        store.put("refresh_token", "ref-456").unwrap();

        assert_eq!(store.get("oauth_token").unwrap().as_deref(), Some("tok-123"));
        store.clear("oauth_token").unwrap();
        assert!(store.get("oauth_token").unwrap().is_none());
        assert_eq!(
            store.get("refresh_token").unwrap().as_deref(),
            Some("ref-456")
        );
    }

    #[test]
    fn test_wrong_passphrase_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        file_store(&dir).put("id", "secret").unwrap();

        let wrong = FileSecretStore::new(dir.path().join(".sync-state"), "letmein");
        assert!(matches!(
            wrong.get("id").unwrap_err(),
            SecretError::Decryption
        ));
    }

    #[test]
    fn test_blob_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        file_store(&dir).put("id", "very-visible-secret").unwrap();

        let raw = std::fs::read(dir.path().join(".sync-state")).unwrap();
        let needle = b"very-visible-secret";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }
}
