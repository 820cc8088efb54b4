// Dual sync indices.
//
// The local index is per-device truth about what this device last saw; the
// remote index is the shared copy other devices use to short-circuit their
// own reconciliation. Both are path-keyed maps of `IndexEntry`, persisted as
// JSON (optionally gzipped) through one write-then-rename choke point.

use crate::hashing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastAction {
    Push,
    Pull,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Push,
    Pull,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Push => write!(f, "push"),
            TransferDirection::Pull => write!(f, "pull"),
        }
    }
}

/// Marker for a deferred transfer parked on the background queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub direction: TransferDirection,
    /// Plaintext digest of the content snapshot taken at enqueue time.
    pub snapshot_hash: String,
    pub enqueued_at_ms: i64,
}

/// Per-path sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Adapter-assigned id, stable across uploads of the same logical file.
    pub file_id: String,
    pub mtime_ms: i64,
    pub size: u64,
    /// Digest as the adapter reports it (ciphertext side when encrypted).
    pub hash: String,
    /// Plaintext digest; equals `hash` when encryption is off.
    pub plain_hash: String,
    /// Plaintext digest of the last version known to be common with the
    /// remote. Only a successful push or pull moves it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ancestor_hash: Option<String>,
    pub last_action: LastAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_transfer: Option<PendingTransfer>,
}

impl IndexEntry {
    /// Entry state after a confirmed pull: local, ancestor and remote agree.
    pub fn pulled(file_id: String, mtime_ms: i64, size: u64, hash: String, plain_hash: String) -> Self {
        IndexEntry {
            file_id,
            mtime_ms,
            size,
            hash: hashing::normalize_digest(&hash),
            ancestor_hash: Some(plain_hash.clone()),
            plain_hash,
            last_action: LastAction::Pull,
            pending_transfer: None,
        }
    }
}

/// Pre-ancestor on-disk entry shape, upgraded at load time.
#[derive(Debug, Deserialize)]
struct FlatEntry {
    file_id: String,
    mtime_ms: i64,
    size: u64,
    hash: String,
    #[serde(default)]
    plain_hash: Option<String>,
}

const INDEX_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    entries: BTreeMap<String, IndexEntry>,
}

/// Path-keyed index map. Iteration order is sorted, which keeps persisted
/// output and reconciliation decisions stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl SyncIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut IndexEntry> {
        self.entries.get_mut(path)
    }

    pub fn insert(&mut self, path: String, entry: IndexEntry) {
        self.entries.insert(path, entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<IndexEntry> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_json(data: &[u8]) -> Result<Self, IndexError> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let is_current = value
            .as_object()
            .map(|o| o.contains_key("version"))
            .unwrap_or(false);

        if is_current {
            let doc: IndexDocument = serde_json::from_value(value)?;
            return Ok(SyncIndex {
                entries: doc.entries,
            });
        }

        // Flat pre-ancestor format: every entry was written right after a
        // push, so the recorded hash doubles as the merge baseline.
        let flat: BTreeMap<String, FlatEntry> = serde_json::from_value(value)?;
        let entries = flat
            .into_iter()
            .map(|(path, old)| {
                let hash = hashing::normalize_digest(&old.hash);
                let plain_hash = old
                    .plain_hash
                    .map(|h| hashing::normalize_digest(&h))
                    .unwrap_or_else(|| hash.clone());
                let entry = IndexEntry {
                    file_id: old.file_id,
                    mtime_ms: old.mtime_ms,
                    size: old.size,
                    hash,
                    ancestor_hash: Some(plain_hash.clone()),
                    plain_hash,
                    last_action: LastAction::Push,
                    pending_transfer: None,
                };
                (path, entry)
            })
            .collect();
        Ok(SyncIndex { entries })
    }

    fn to_json(&self) -> Result<Vec<u8>, IndexError> {
        let doc = IndexDocument {
            version: INDEX_FORMAT_VERSION,
            entries: self.entries.clone(),
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    }

    /// Serialize to the uploadable document form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        self.to_json()
    }

    /// Parse an index document downloaded from the remote.
    pub fn from_bytes(data: &[u8]) -> Result<Self, IndexError> {
        Self::from_json(data)
    }
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// On-disk store for one index file.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
    compress: bool,
}

impl IndexStore {
    pub fn new(path: PathBuf, compress: bool) -> Self {
        IndexStore { path, compress }
    }

    /// Load the index, upgrading older formats in place. Missing file means
    /// a fresh device: empty index.
    pub async fn load(&self) -> Result<SyncIndex, IndexError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SyncIndex::new()),
            Err(e) => return Err(e.into()),
        };

        // Detect compression by magic rather than config, so toggling the
        // setting never strands an existing file.
        let json = if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
            let mut decoder = flate2::read::GzDecoder::new(raw.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        } else {
            raw
        };
        SyncIndex::from_json(&json)
    }

    /// Persist atomically: serialize, optionally gzip, write to a staging
    /// file, rename over the target.
    pub async fn save(&self, index: &SyncIndex) -> Result<(), IndexError> {
        let json = index.to_json()?;
        let payload = if self.compress {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?
        } else {
            json
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = self.path.with_extension("tmp");
        tokio::fs::write(&staged, &payload).await?;
        tokio::fs::rename(&staged, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str) -> IndexEntry {
        IndexEntry {
            file_id: "f1".to_string(),
            mtime_ms: 1000,
            size: 5,
            hash: hash.to_string(),
            plain_hash: hash.to_string(),
            ancestor_hash: Some(hash.to_string()),
            last_action: LastAction::Push,
            pending_transfer: None,
        }
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path().join("local-index.json"), false);

        let mut index = SyncIndex::new();
        index.insert("notes/a.md".to_string(), entry("aa"));
        store.save(&index).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, index);
    }

    #[tokio::test]
    async fn test_compressed_roundtrip_and_magic_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local-index.json");

        let mut index = SyncIndex::new();
        index.insert("a.md".to_string(), entry("aa"));
        IndexStore::new(path.clone(), true).save(&index).await.unwrap();

        let raw = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&raw[..2], &GZIP_MAGIC);

        // Loading with compression off still works: magic wins over config.
        let loaded = IndexStore::new(path, false).load().await.unwrap();
        assert_eq!(loaded, index);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path().join("nope.json"), false);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flat_format_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local-index.json");
        let flat = serde_json::json!({
            "notes/a.md": {
                "file_id": "f9",
                "mtime_ms": 123,
                "size": 7,
                "hash": "ABCDEF"
            }
        });
        tokio::fs::write(&path, serde_json::to_vec(&flat).unwrap())
            .await
            .unwrap();

        let index = IndexStore::new(path, false).load().await.unwrap();
        let migrated = index.get("notes/a.md").unwrap();
        assert_eq!(migrated.hash, "abcdef");
        assert_eq!(migrated.plain_hash, "abcdef");
        assert_eq!(migrated.ancestor_hash.as_deref(), Some("abcdef"));
        assert_eq!(migrated.last_action, LastAction::Push);
    }
}
