// Cross-device communication document.
//
// A single JSON file on the shared store carries short-lived advisory merge
// locks. Acquisition is optimistic read-modify-write with a read-your-write
// check: if the verify read shows another holder, the write raced and the
// lock was not acquired. Expired locks are treated as free by everyone, so a
// crashed device never wedges a path for longer than the TTL.

use crate::adapter::{Adapter, AdapterError};
use crate::config::COMMUNICATION_PATH;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default lock lifetime.
pub const MERGE_LOCK_TTL_MS: i64 = 5 * 60 * 1000;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeLock {
    pub holder: String,
    pub acquired_at_ms: i64,
    pub ttl_ms: i64,
}

impl MergeLock {
    fn expired(&self, now_ms: i64) -> bool {
        now_ms >= self.acquired_at_ms + self.ttl_ms
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommunicationDoc {
    #[serde(default)]
    pub merge_locks: BTreeMap<String, MergeLock>,
}

/// Lock state for a path, as seen by `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub holder: Option<String>,
    pub expires_in_ms: Option<i64>,
}

/// Merge-lock operations over the shared communication document.
#[derive(Clone)]
pub struct MergeLockManager {
    adapter: Arc<dyn Adapter>,
    device_id: String,
}

impl MergeLockManager {
    pub fn new(adapter: Arc<dyn Adapter>, device_id: &str) -> Self {
        MergeLockManager {
            adapter,
            device_id: device_id.to_string(),
        }
    }

    async fn read_doc(&self) -> Result<CommunicationDoc, CommError> {
        let meta = self.adapter.get_file_metadata(COMMUNICATION_PATH).await?;
        let Some(record) = meta else {
            return Ok(CommunicationDoc::default());
        };
        let raw = self.adapter.download_file(&record.id).await?;
        match serde_json::from_slice(&raw) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                // A torn or corrupted doc must not block merging forever.
                warn!(error = %e, "communication doc unreadable, starting fresh");
                Ok(CommunicationDoc::default())
            }
        }
    }

    async fn write_doc(&self, doc: &CommunicationDoc) -> Result<(), CommError> {
        let payload = serde_json::to_vec_pretty(doc)?;
        let existing = self
            .adapter
            .get_file_metadata(COMMUNICATION_PATH)
            .await?
            .map(|r| r.id);
        self.adapter
            .upload_file(
                COMMUNICATION_PATH,
                &payload,
                now_ms(),
                existing.as_deref(),
            )
            .await?;
        Ok(())
    }

    /// Try to take the merge lock for `path`.
    ///
    /// Returns `false` when another device holds a live lock, or when the
    /// read-your-write verification shows this write lost a race.
    pub async fn acquire(&self, path: &str) -> Result<bool, CommError> {
        let now = now_ms();
        let mut doc = self.read_doc().await?;

        if let Some(existing) = doc.merge_locks.get(path) {
            if existing.holder != self.device_id && !existing.expired(now) {
                debug!(path, holder = %existing.holder, "merge lock held elsewhere");
                return Ok(false);
            }
        }

        doc.merge_locks.insert(
            path.to_string(),
            MergeLock {
                holder: self.device_id.clone(),
                acquired_at_ms: now,
                ttl_ms: MERGE_LOCK_TTL_MS,
            },
        );
        self.write_doc(&doc).await?;

        // Read back: if the winner of a concurrent write isn't us, back off.
        let verify = self.read_doc().await?;
        let ours = verify
            .merge_locks
            .get(path)
            .map(|lock| lock.holder == self.device_id)
            .unwrap_or(false);
        if !ours {
            debug!(path, "lost merge lock race");
        }
        Ok(ours)
    }

    /// Release a lock this device holds. Releasing a lock someone else won
    /// in the meantime is left alone.
    pub async fn release(&self, path: &str) -> Result<(), CommError> {
        let mut doc = self.read_doc().await?;
        match doc.merge_locks.get(path) {
            Some(lock) if lock.holder == self.device_id => {
                doc.merge_locks.remove(path);
                self.write_doc(&doc).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Non-mutating lock inspection.
    pub async fn check(&self, path: &str) -> Result<LockStatus, CommError> {
        let now = now_ms();
        let doc = self.read_doc().await?;
        match doc.merge_locks.get(path) {
            Some(lock) if !lock.expired(now) => Ok(LockStatus {
                locked: true,
                holder: Some(lock.holder.clone()),
                expires_in_ms: Some(lock.acquired_at_ms + lock.ttl_ms - now),
            }),
            _ => Ok(LockStatus {
                locked: false,
                holder: None,
                expires_in_ms: None,
            }),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
