use std::path::PathBuf;

/// Remote path of the shared sync index document.
pub const REMOTE_INDEX_PATH: &str = "data/remote/sync-index.json";
/// Remote path of the cross-device communication document (merge locks).
pub const COMMUNICATION_PATH: &str = "data/remote/communication.json";
/// Remote path of the wrapped vault key. Its presence marks the vault as encrypted.
pub const VAULT_LOCK_PATH: &str = "data/remote/vault-lock.vault";
/// Remote path of the migration sentinel used to serialize concurrent migrations.
pub const MIGRATION_LOCK_PATH: &str = "data/remote/migration.lock";

/// Engine configuration provided by the host.
///
/// Hosts construct this once at startup; everything that varies per device
/// (device id, data root) or per user (exclusions, thresholds) lives here.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Stable identifier of this device, used for merge locks and transfer logs.
    pub device_id: String,
    /// Local directory for engine state (indices, logs, secret fallback file).
    pub data_root: PathBuf,
    /// Files at or above this many plaintext bytes are deferred to the
    /// background transfer queue instead of transferring inline.
    pub large_file_threshold: u64,
    /// Plaintext size at which uploads switch from the single-blob format to
    /// the chunked format. `0` disables chunking entirely.
    pub chunked_format_threshold: u64,
    /// Shell-style exclusion patterns (`*`, `?`, `**`) supplied by the user.
    pub user_exclusions: Vec<String>,
    /// Gzip the persisted indices.
    pub compress_index: bool,
    /// Whether client-side encryption is active for this vault.
    pub encryption_enabled: bool,
    /// Minimum delay between background transfer items, if throttling.
    pub bg_transfer_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        SyncConfig {
            device_id: uuid::Uuid::new_v4().to_string(),
            data_root: home_dir.join(".vaultsync"),
            large_file_threshold: 4 * 1024 * 1024,
            chunked_format_threshold: 4 * 1024 * 1024,
            user_exclusions: Vec::new(),
            compress_index: false,
            encryption_enabled: false,
            bg_transfer_interval_secs: None,
        }
    }
}

impl SyncConfig {
    /// Path of the on-disk local index file.
    pub fn local_index_path(&self) -> PathBuf {
        self.data_root.join("data").join("local").join("local-index.json")
    }

    /// Path of the on-disk copy of the remote index.
    pub fn remote_index_cache_path(&self) -> PathBuf {
        self.data_root.join("data").join("local").join("remote-index.json")
    }

    /// Path of the encrypted secret-store fallback file.
    pub fn secret_file_path(&self) -> PathBuf {
        self.data_root.join("data").join("local").join(".sync-state")
    }

    /// Directory holding merge-base sidecar files, keyed by content digest.
    pub fn baseline_dir(&self) -> PathBuf {
        self.data_root.join("data").join("local").join("baselines")
    }

    /// Directory for this device's transfer history logs.
    pub fn transfer_log_dir(&self) -> PathBuf {
        self.data_root.join("logs").join(&self.device_id)
    }
}
