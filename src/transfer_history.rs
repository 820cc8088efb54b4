// Transfer history: what moved, when, and how it ended.
//
// Terminal transfer outcomes are kept two ways: a 500-entry in-memory ring
// for the host UI, and daily JSONL files under `logs/<device_id>/` for
// inspection after the fact. On startup the current day's file seeds the
// ring; files older than a week are deleted.

use crate::index::TransferDirection;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Ring capacity; oldest entries are trimmed first.
pub const HISTORY_RING_CAP: usize = 500;
/// Daily log files older than this many days are removed.
pub const HISTORY_RETENTION_DAYS: i64 = 7;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Terminal status of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Immutable snapshot of one finished transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub direction: TransferDirection,
    pub path: String,
    pub size: u64,
    pub outcome: TransferOutcome,
    pub retries: u32,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct TransferHistory {
    log_dir: PathBuf,
    ring: VecDeque<TransferRecord>,
}

impl TransferHistory {
    /// Open the history for one device, loading today's log back into the
    /// ring and pruning expired files.
    pub async fn open(log_dir: PathBuf) -> Result<Self, HistoryError> {
        tokio::fs::create_dir_all(&log_dir).await?;
        let mut history = TransferHistory {
            log_dir,
            ring: VecDeque::new(),
        };
        history.load_today().await?;
        history.prune_old_files().await?;
        Ok(history)
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.log_dir
            .join(format!("transfers-{}.jsonl", date.format("%Y-%m-%d")))
    }

    async fn load_today(&mut self) -> Result<(), HistoryError> {
        let path = self.file_for(Utc::now().date_naive());
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<TransferRecord>(line) {
                Ok(record) => self.push_ring(record),
                Err(e) => warn!(error = %e, "skipping malformed history line"),
            }
        }
        debug!(entries = self.ring.len(), "loaded transfer history");
        Ok(())
    }

    async fn prune_old_files(&self) -> Result<(), HistoryError> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(HISTORY_RETENTION_DAYS);
        let mut entries = tokio::fs::read_dir(&self.log_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = name
                .strip_prefix("transfers-")
                .and_then(|n| n.strip_suffix(".jsonl"))
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if date < cutoff {
                debug!(file = name, "removing expired transfer log");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    fn push_ring(&mut self, record: TransferRecord) {
        self.ring.push_back(record);
        while self.ring.len() > HISTORY_RING_CAP {
            self.ring.pop_front();
        }
    }

    /// Record one finished transfer: ring + append to today's file.
    pub async fn record(&mut self, record: TransferRecord) -> Result<(), HistoryError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let path = self.file_for(Utc::now().date_naive());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;

        self.push_ring(record);
        Ok(())
    }

    /// Records newest-first.
    pub fn list(&self) -> Vec<TransferRecord> {
        self.ring.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
