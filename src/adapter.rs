// Remote store adapter boundary.
//
// The engine never talks to a cloud provider directly; it goes through the
// `Adapter` trait. Required operations are plain trait methods. Optional
// operations (resumable uploads, change feed, revision history) have default
// implementations returning `AdapterError::Unsupported`, and matching
// capability flags so callers can route before calling.

pub mod memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Operation not supported by adapter: {operation}")]
    Unsupported { operation: &'static str },
    #[error("Remote file not found: {0}")]
    NotFound(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// True for failures worth retrying (timeouts, 5xx, rate limits).
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Network(_))
    }
}

/// Kind of a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    File,
    Folder,
}

/// One entry in a remote listing.
///
/// `hash` may be absent for virtual or proprietary files; everything the
/// reconciler does with it is guarded on `Option`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub path: String,
    pub kind: RemoteKind,
    /// Last-modified time in epoch milliseconds.
    pub mtime_ms: i64,
    pub size: u64,
    pub hash: Option<String>,
}

/// One entry from the change feed.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub file_id: String,
    pub path: Option<String>,
    /// True when the file was deleted or trashed remotely.
    pub removed: bool,
    pub record: Option<RemoteRecord>,
}

/// Result of polling the change feed.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub new_token: String,
    pub changes: Vec<RemoteChange>,
}

/// A revision of a remote file, newest first in listings.
#[derive(Debug, Clone)]
pub struct RevisionInfo {
    pub id: String,
    pub mtime_ms: i64,
    pub size: u64,
    pub hash: Option<String>,
    pub keep_forever: bool,
}

/// Remote object store capability set.
///
/// Implementations must be cheap to clone behind `Arc<dyn Adapter>`; every
/// method is a suspension point.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    fn vault_name(&self) -> &str;

    fn supports_changes_api(&self) -> bool {
        false
    }
    fn supports_hash(&self) -> bool {
        false
    }
    fn supports_history(&self) -> bool {
        false
    }
    fn supports_resumable_uploads(&self) -> bool {
        false
    }

    /// List files under `folder`, or the whole vault when `None`.
    async fn list_files(&self, folder: Option<&str>) -> Result<Vec<RemoteRecord>, AdapterError>;

    async fn get_file_metadata(&self, path: &str) -> Result<Option<RemoteRecord>, AdapterError>;

    /// Metadata lookup by stable file id. `known_path` is a hint adapters may
    /// use to avoid an extra round trip.
    async fn get_file_metadata_by_id(
        &self,
        id: &str,
        known_path: Option<&str>,
    ) -> Result<Option<RemoteRecord>, AdapterError>;

    async fn download_file(&self, id: &str) -> Result<Vec<u8>, AdapterError>;

    async fn upload_file(
        &self,
        path: &str,
        data: &[u8],
        mtime_ms: i64,
        existing_id: Option<&str>,
    ) -> Result<RemoteRecord, AdapterError>;

    /// Open a resumable upload session for `path` with a declared total size.
    async fn initiate_resumable_session(
        &self,
        _path: &str,
        _total: u64,
        _mtime_ms: i64,
        _existing_id: Option<&str>,
    ) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "initiate_resumable_session",
        })
    }

    /// Upload one chunk at an absolute offset. Chunks must be 256 KiB-aligned
    /// except the final one; the final chunk's response carries the record.
    async fn upload_chunk(
        &self,
        _session: &str,
        _data: &[u8],
        _offset: u64,
        _total: u64,
        _path: &str,
        _mtime_ms: i64,
    ) -> Result<Option<RemoteRecord>, AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "upload_chunk",
        })
    }

    async fn delete_file(&self, id: &str) -> Result<(), AdapterError>;

    async fn move_file(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<RemoteRecord, AdapterError>;

    async fn create_folder(&self, path: &str) -> Result<String, AdapterError>;

    async fn ensure_folders_exist(&self, paths: &[String]) -> Result<(), AdapterError>;

    async fn get_start_page_token(&self) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "get_start_page_token",
        })
    }

    async fn get_changes(&self, _token: &str) -> Result<ChangeSet, AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "get_changes",
        })
    }

    async fn list_revisions(&self, _path: &str) -> Result<Vec<RevisionInfo>, AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "list_revisions",
        })
    }

    async fn get_revision_content(
        &self,
        _path: &str,
        _revision_id: &str,
    ) -> Result<Vec<u8>, AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "get_revision_content",
        })
    }

    async fn set_revision_keep_forever(
        &self,
        _path: &str,
        _revision_id: &str,
        _keep: bool,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "set_revision_keep_forever",
        })
    }

    async fn delete_revision(&self, _path: &str, _revision_id: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "delete_revision",
        })
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        true
    }

    async fn logout(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Drop any adapter-side caches (listings, sessions).
    async fn reset(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
