// Background transfer queue.
//
// Large transfers are deferred here instead of running inside the sync
// cycle. One worker task drains items serially in priority order (FIFO on
// ties); the orchestrator pauses the queue for the duration of a cycle.
// Execution itself is behind the `TransferExecutor` trait so the worker
// stays ignorant of indices, vaults and adapters.
//
// Invariant: at most one live item per (path, direction). Enqueueing over a
// pending duplicate replaces it (and frees its buffered snapshot); while a
// duplicate is actively uploading the new request is dropped, because the
// staleness re-check at execution time already covers it.

use crate::index::TransferDirection;
use crate::transfer_history::{TransferHistory, TransferOutcome, TransferRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

/// Executions per item before it is declared failed: one initial attempt
/// plus `MAX_RETRIES` retries.
const MAX_RETRIES: u32 = 3;
/// Base backoff; attempt `n` waits `base · 2^(n-1)`.
const BACKOFF_BASE_SECS: u64 = 5;
/// Backoff ceiling.
const BACKOFF_CAP_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferPriority {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Active,
}

/// What the host asks the queue to move.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub path: String,
    pub size: u64,
    pub priority: TransferPriority,
    /// Buffered plaintext snapshot for pushes; released on terminal status.
    pub content: Option<Vec<u8>>,
    pub mtime_ms: Option<i64>,
    /// Plaintext digest of `content` at enqueue time.
    pub snapshot_hash: Option<String>,
    /// Last known remote digest, for the conflict re-check.
    pub remote_hash: Option<String>,
    pub file_id: Option<String>,
}

/// A live queue item.
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub id: String,
    pub direction: TransferDirection,
    pub path: String,
    pub size: u64,
    pub priority: TransferPriority,
    pub state: TransferState,
    pub retries: u32,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub content: Option<Vec<u8>>,
    pub mtime_ms: Option<i64>,
    pub snapshot_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub file_id: Option<String>,
    seq: u64,
}

/// Row in the host-facing transfer list. Inline entries come first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferView {
    pub path: String,
    pub direction: TransferDirection,
    pub active: bool,
    pub inline: bool,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started {
        id: String,
        path: String,
        direction: TransferDirection,
    },
    Completed {
        record: TransferRecord,
    },
    Failed {
        record: TransferRecord,
    },
    QueueChanged,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    Completed,
    /// Not an error: the item no longer applies (stale snapshot, remote
    /// moved, path dirty). The path stays dirty for the next cycle.
    Cancelled { reason: String },
    Failed { error: String, transient: bool },
}

#[async_trait::async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(&self, item: &TransferItem) -> ExecuteOutcome;
}

struct InlineEntry {
    id: u64,
    path: String,
    direction: TransferDirection,
}

#[derive(Default)]
struct QueueState {
    items: Vec<TransferItem>,
    inline: Vec<InlineEntry>,
    next_seq: u64,
    next_inline_id: u64,
}

impl QueueState {
    fn pick_next(&mut self) -> Option<TransferItem> {
        let idx = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.state == TransferState::Pending)
            .min_by_key(|(_, item)| (item.priority, item.seq))
            .map(|(idx, _)| idx)?;
        let item = &mut self.items[idx];
        item.state = TransferState::Active;
        item.started_at_ms = Some(now_ms());
        Some(item.clone())
    }
}

/// Handle to the queue; cheap to clone.
#[derive(Clone)]
pub struct TransferQueue {
    state: Arc<Mutex<QueueState>>,
    history: Arc<Mutex<TransferHistory>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    wakeup: Arc<Notify>,
    paused: Arc<AtomicBool>,
    online: Arc<AtomicBool>,
    encryption_locked: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    throttle: Option<Duration>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl TransferQueue {
    pub fn new(
        history: TransferHistory,
        throttle: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let queue = TransferQueue {
            state: Arc::new(Mutex::new(QueueState::default())),
            history: Arc::new(Mutex::new(history)),
            events,
            wakeup: Arc::new(Notify::new()),
            paused: Arc::new(AtomicBool::new(false)),
            online: Arc::new(AtomicBool::new(true)),
            encryption_locked: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            throttle,
            worker: Arc::new(Mutex::new(None)),
        };
        (queue, events_rx)
    }

    pub fn history(&self) -> Arc<Mutex<TransferHistory>> {
        self.history.clone()
    }

    /// Start the single worker task.
    pub async fn start(&self, executor: Arc<dyn TransferExecutor>) {
        let queue = self.clone();
        let handle = tokio::spawn(async move { queue.worker_loop(executor).await });
        *self.worker.lock().await = Some(handle);
    }

    /// Stop the worker; pending items stay queued in memory until drop.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    /// Host connectivity signal.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.wakeup.notify_waiters();
        }
    }

    /// Gate used while the vault key is locked away.
    pub fn set_encryption_locked(&self, locked: bool) {
        self.encryption_locked.store(locked, Ordering::SeqCst);
        if !locked {
            self.wakeup.notify_waiters();
        }
    }

    fn gated(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
            || !self.online.load(Ordering::SeqCst)
            || self.encryption_locked.load(Ordering::SeqCst)
    }

    /// Enqueue a deferred transfer, deduplicating per (path, direction).
    pub async fn enqueue(&self, request: TransferRequest) -> String {
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .items
            .iter()
            .position(|i| i.path == request.path && i.direction == request.direction)
        {
            match state.items[existing].state {
                TransferState::Pending => {
                    debug!(path = %request.path, "replacing queued duplicate");
                    state.items.remove(existing);
                }
                TransferState::Active => {
                    // The running attempt re-checks staleness itself.
                    debug!(path = %request.path, "duplicate of active item dropped");
                    return state.items[existing].id.clone();
                }
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.items.push(TransferItem {
            id: id.clone(),
            direction: request.direction,
            path: request.path,
            size: request.size,
            priority: request.priority,
            state: TransferState::Pending,
            retries: 0,
            created_at_ms: now_ms(),
            started_at_ms: None,
            content: request.content,
            mtime_ms: request.mtime_ms,
            snapshot_hash: request.snapshot_hash,
            remote_hash: request.remote_hash,
            file_id: request.file_id,
            seq,
        });
        drop(state);

        let _ = self.events.send(TransferEvent::QueueChanged);
        self.wakeup.notify_one();
        id
    }

    pub async fn has_pending(&self) -> bool {
        !self.state.lock().await.items.is_empty()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Unified host-facing transfer list: inline first, then queue items.
    pub async fn current_transfers(&self) -> Vec<TransferView> {
        let state = self.state.lock().await;
        let mut views: Vec<TransferView> = state
            .inline
            .iter()
            .map(|entry| TransferView {
                path: entry.path.clone(),
                direction: entry.direction,
                active: true,
                inline: true,
                retries: 0,
            })
            .collect();
        views.extend(state.items.iter().map(|item| TransferView {
            path: item.path.clone(),
            direction: item.direction,
            active: item.state == TransferState::Active,
            inline: false,
            retries: item.retries,
        }));
        views
    }

    /// Report an inline (in-cycle) transfer starting.
    pub async fn mark_inline_start(&self, path: &str, direction: TransferDirection) -> u64 {
        let mut state = self.state.lock().await;
        state.next_inline_id += 1;
        let id = state.next_inline_id;
        state.inline.push(InlineEntry {
            id,
            path: path.to_string(),
            direction,
        });
        drop(state);
        let _ = self.events.send(TransferEvent::QueueChanged);
        id
    }

    pub async fn mark_inline_end(&self, inline_id: u64) {
        let mut state = self.state.lock().await;
        state.inline.retain(|entry| entry.id != inline_id);
        drop(state);
        let _ = self.events.send(TransferEvent::QueueChanged);
    }

    async fn worker_loop(&self, executor: Arc<dyn TransferExecutor>) {
        info!("transfer worker started");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.gated() {
                self.wakeup.notified().await;
                continue;
            }

            let item = self.state.lock().await.pick_next();
            let Some(item) = item else {
                self.wakeup.notified().await;
                continue;
            };

            let _ = self.events.send(TransferEvent::Started {
                id: item.id.clone(),
                path: item.path.clone(),
                direction: item.direction,
            });

            let outcome = executor.execute(&item).await;
            match outcome {
                ExecuteOutcome::Completed => {
                    self.finalize(&item.id, TransferOutcome::Completed, None).await;
                }
                ExecuteOutcome::Cancelled { reason } => {
                    debug!(path = %item.path, reason = %reason, "transfer cancelled");
                    self.finalize(&item.id, TransferOutcome::Cancelled, Some(reason))
                        .await;
                }
                ExecuteOutcome::Failed { error, transient } => {
                    let attempt = item.retries + 1;
                    if transient && item.retries < MAX_RETRIES {
                        let delay = backoff_for_attempt(attempt);
                        warn!(
                            path = %item.path,
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %error,
                            "transfer attempt failed, retrying"
                        );
                        // Revert to pending so the item still counts as
                        // queued work during the backoff window.
                        {
                            let mut state = self.state.lock().await;
                            if let Some(entry) =
                                state.items.iter_mut().find(|i| i.id == item.id)
                            {
                                entry.state = TransferState::Pending;
                                entry.retries = attempt;
                            }
                        }
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(path = %item.path, error = %error, "transfer failed permanently");
                        self.finalize(&item.id, TransferOutcome::Failed, Some(error)).await;
                    }
                }
            }

            if let Some(interval) = self.throttle {
                tokio::time::sleep(interval).await;
            }
        }
        info!("transfer worker stopped");
    }

    async fn finalize(&self, item_id: &str, outcome: TransferOutcome, error: Option<String>) {
        let removed = {
            let mut state = self.state.lock().await;
            let idx = state.items.iter().position(|i| i.id == item_id);
            idx.map(|idx| state.items.remove(idx))
        };
        let Some(item) = removed else { return };

        let record = TransferRecord {
            id: item.id,
            direction: item.direction,
            path: item.path,
            size: item.size,
            outcome,
            retries: item.retries,
            created_at_ms: item.created_at_ms,
            started_at_ms: item.started_at_ms,
            completed_at_ms: Some(now_ms()),
            error,
        };
        if let Err(e) = self.history.lock().await.record(record.clone()).await {
            warn!(error = %e, "failed to persist transfer record");
        }

        let event = match outcome {
            TransferOutcome::Completed => TransferEvent::Completed { record },
            TransferOutcome::Failed => TransferEvent::Failed { record },
            TransferOutcome::Cancelled => TransferEvent::QueueChanged,
        };
        let _ = self.events.send(event);
    }
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS.saturating_mul(1u64 << (attempt - 1).min(10));
    Duration::from_secs(secs.min(BACKOFF_CAP_SECS))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct ScriptedExecutor {
        /// Transient failures to inject before succeeding.
        failures: AtomicU32,
        executions: AtomicU32,
    }

    impl ScriptedExecutor {
        fn new(failures: u32) -> Self {
            ScriptedExecutor {
                failures: AtomicU32::new(failures),
                executions: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl TransferExecutor for ScriptedExecutor {
        async fn execute(&self, _item: &TransferItem) -> ExecuteOutcome {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                ExecuteOutcome::Failed {
                    error: "injected".to_string(),
                    transient: true,
                }
            } else {
                ExecuteOutcome::Completed
            }
        }
    }

    async fn queue_with(
        throttle: Option<Duration>,
    ) -> (TransferQueue, mpsc::UnboundedReceiver<TransferEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let history = TransferHistory::open(dir.path().to_path_buf()).await.unwrap();
        let (queue, events) = TransferQueue::new(history, throttle);
        (queue, events, dir)
    }

    fn push_request(path: &str, priority: TransferPriority) -> TransferRequest {
        TransferRequest {
            direction: TransferDirection::Push,
            path: path.to_string(),
            size: 3,
            priority,
            content: Some(b"abc".to_vec()),
            mtime_ms: Some(1),
            snapshot_hash: Some("hash".to_string()),
            remote_hash: None,
            file_id: None,
        }
    }

    async fn wait_for_drain(queue: &TransferQueue) {
        for _ in 0..200 {
            if !queue.has_pending().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_and_records() {
        let (queue, mut events, _dir) = queue_with(None).await;
        queue.start(Arc::new(ScriptedExecutor::new(0))).await;
        queue.enqueue(push_request("a.md", TransferPriority::Normal)).await;
        wait_for_drain(&queue).await;

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Completed { record } = event {
                assert_eq!(record.path, "a.md");
                assert_eq!(record.outcome, TransferOutcome::Completed);
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        assert_eq!(queue.history().lock().await.len(), 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let (queue, _events, _dir) = queue_with(None).await;
        let executor = Arc::new(ScriptedExecutor::new(2));
        queue.start(executor.clone()).await;
        queue.enqueue(push_request("a.md", TransferPriority::Normal)).await;
        wait_for_drain(&queue).await;

        assert_eq!(executor.executions.load(Ordering::SeqCst), 3);
        let history = queue.history();
        let history = history.lock().await;
        assert_eq!(history.list()[0].outcome, TransferOutcome::Completed);
        assert_eq!(history.list()[0].retries, 2);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail() {
        let (queue, mut events, _dir) = queue_with(None).await;
        let executor = Arc::new(ScriptedExecutor::new(10));
        queue.start(executor.clone()).await;
        queue.enqueue(push_request("a.md", TransferPriority::Normal)).await;
        wait_for_drain(&queue).await;

        // Initial attempt plus three retries.
        assert_eq!(executor.executions.load(Ordering::SeqCst), 4);
        let mut failed = None;
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Failed { record } = event {
                failed = Some(record);
            }
        }
        let record = failed.expect("no failure event");
        assert_eq!(record.outcome, TransferOutcome::Failed);
        assert_eq!(record.retries, 3);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_pending_replaced() {
        let (queue, _events, _dir) = queue_with(None).await;
        // No worker: items stay pending.
        let first = queue.enqueue(push_request("a.md", TransferPriority::Normal)).await;
        let second = queue.enqueue(push_request("a.md", TransferPriority::Normal)).await;
        assert_ne!(first, second);
        assert_eq!(queue.pending_len().await, 1);

        // Different direction is a different slot.
        let mut pull = push_request("a.md", TransferPriority::Normal);
        pull.direction = TransferDirection::Pull;
        pull.content = None;
        queue.enqueue(pull).await;
        assert_eq!(queue.pending_len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_fifo_ties() {
        let (queue, mut events, _dir) = queue_with(None).await;
        queue.pause();
        queue.start(Arc::new(ScriptedExecutor::new(0))).await;
        queue.enqueue(push_request("n1.md", TransferPriority::Normal)).await;
        queue.enqueue(push_request("n2.md", TransferPriority::Normal)).await;
        queue.enqueue(push_request("hot.md", TransferPriority::Critical)).await;
        queue.resume();
        wait_for_drain(&queue).await;

        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Started { path, .. } = event {
                started.push(path);
            }
        }
        assert_eq!(started, vec!["hot.md", "n1.md", "n2.md"]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_gates_worker() {
        let (queue, _events, _dir) = queue_with(None).await;
        let executor = Arc::new(ScriptedExecutor::new(0));
        queue.set_online(false);
        queue.start(executor.clone()).await;
        queue.enqueue(push_request("a.md", TransferPriority::Normal)).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(executor.executions.load(Ordering::SeqCst), 0);
        assert!(queue.has_pending().await);

        queue.set_online(true);
        wait_for_drain(&queue).await;
        assert_eq!(executor.executions.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inline_entries_come_first() {
        let (queue, _events, _dir) = queue_with(None).await;
        queue.enqueue(push_request("queued.md", TransferPriority::Normal)).await;
        let inline_id = queue
            .mark_inline_start("inline.md", TransferDirection::Pull)
            .await;

        let views = queue.current_transfers().await;
        assert_eq!(views[0].path, "inline.md");
        assert!(views[0].inline);
        assert_eq!(views[1].path, "queued.md");

        queue.mark_inline_end(inline_id).await;
        assert_eq!(queue.current_transfers().await.len(), 1);
    }
}
