// Sync orchestration.
//
// One state machine per device: IDLE → PULLING → MERGING → PUSHING →
// (SCANNING) → IDLE. Requests arriving while a cycle runs are coalesced into
// a single trailing re-request whose flags are merged. The cycle pauses the
// background queue, reuses one remote listing for both directions, and
// finishes by uploading the shared index — the commit point of the cycle.
//
// All cycle steps are free functions over `SyncContext`; nothing here holds
// a back-reference to anything.

use crate::adapter::{Adapter, AdapterError, RemoteKind, RemoteRecord};
use crate::comm::{CommError, MergeLockManager};
use crate::config::{SyncConfig, REMOTE_INDEX_PATH};
use crate::dirty::DirtyTracker;
use crate::encrypted_adapter::{ContentStore, ContentStoreError};
use crate::encryption::CryptoError;
use crate::hashing;
use crate::index::{
    IndexEntry, IndexError, IndexStore, LastAction, PendingTransfer, SyncIndex, TransferDirection,
};
use crate::merge::{self, MergeDecision};
use crate::path_filter::{FilterError, PathFilter};
use crate::reconcile::{self, QuickCheck, ReconcileInput, ReconcilePlan};
use crate::transfer_history::{HistoryError, TransferHistory};
use crate::transfer_queue::{
    ExecuteOutcome, TransferEvent, TransferExecutor, TransferItem, TransferPriority,
    TransferQueue, TransferRequest,
};
use crate::vault::{LocalFile, Vault, VaultError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// A full-scan checkpoint older than this is discarded.
const SCAN_CHECKPOINT_TTL_MS: i64 = 5 * 60 * 1000;
/// Files hashed between interruption checks during a full scan.
const SCAN_CHUNK: usize = 50;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("Content error: {0}")]
    Content(#[from] ContentStoreError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Communication error: {0}")]
    Comm(#[from] CommError),
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("History error: {0}")]
    History(#[from] HistoryError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Refusing to delete {count} local files: remote listing looks incomplete")]
    MassDeleteRefused { count: usize },
    #[error("Migration refused: {0}")]
    MigrationRefused(String),
    #[error("Engine is busy: {0}")]
    Busy(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Pulling,
    Pushing,
    Merging,
    Scanning,
    Migrating,
}

/// One sync request from the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRequest {
    /// Suppress host-visible notices for this cycle.
    pub is_silent: bool,
    /// Re-hash the whole tree instead of trusting the quick check.
    pub scan_vault: bool,
}

impl SyncRequest {
    fn merged_with(self, other: SyncRequest) -> SyncRequest {
        SyncRequest {
            is_silent: self.is_silent && other.is_silent,
            scan_vault: self.scan_vault || other.scan_vault,
        }
    }
}

/// Host-facing notifications.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    CycleStarted { scan: bool },
    CycleCompleted { changed: bool },
    CycleFailed { error: String },
    ConflictRenamed { path: String, conflict_path: String },
    MergeDeferred { path: String, holder: Option<String> },
    MassDeleteRefused { count: usize },
    MigrationCompleted,
    MigrationRefused { reason: String },
}

struct ScanCheckpoint {
    /// Last fully hashed path.
    cursor: String,
    last_tick_ms: i64,
}

/// Everything a cycle step needs, shared by reference.
pub struct SyncContext {
    pub config: SyncConfig,
    pub vault: Vault,
    store: std::sync::RwLock<ContentStore>,
    pub filter: PathFilter,
    pub dirty: DirtyTracker,
    pub locks: MergeLockManager,
    pub queue: TransferQueue,
    pub local_index: Mutex<SyncIndex>,
    pub remote_index: Mutex<SyncIndex>,
    local_store: IndexStore,
    remote_store: IndexStore,
    events: mpsc::UnboundedSender<SyncEvent>,
    change_token: Mutex<Option<String>>,
    scan_checkpoint: Mutex<Option<ScanCheckpoint>>,
    interrupted: AtomicBool,
}

impl SyncContext {
    /// Current content store (swapped wholesale by migration).
    pub fn store(&self) -> ContentStore {
        self.store.read().unwrap().clone()
    }

    pub(crate) fn replace_store(&self, store: ContentStore) {
        *self.store.write().unwrap() = store;
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn persist_indices(&self) -> Result<(), IndexError> {
        self.local_store.save(&*self.local_index.lock().await).await?;
        self.remote_store
            .save(&*self.remote_index.lock().await)
            .await?;
        Ok(())
    }
}

/// Receivers for everything the engine reports to the host.
pub struct EngineEvents {
    pub sync: mpsc::UnboundedReceiver<SyncEvent>,
    pub transfers: mpsc::UnboundedReceiver<TransferEvent>,
}

struct OrchestratorInner {
    state: SyncState,
    rerequest: Option<SyncRequest>,
}

/// The per-device sync engine.
#[derive(Clone)]
pub struct SyncOrchestrator {
    ctx: Arc<SyncContext>,
    inner: Arc<Mutex<OrchestratorInner>>,
}

impl SyncOrchestrator {
    /// Build the engine and start the background transfer worker.
    pub async fn new(
        config: SyncConfig,
        vault_root: std::path::PathBuf,
        adapter: Arc<dyn Adapter>,
        encryption: Option<crate::encryption::EncryptionEngine>,
    ) -> Result<(Self, EngineEvents), SyncError> {
        let filter = PathFilter::new(&config.user_exclusions)?;
        let history = TransferHistory::open(config.transfer_log_dir()).await?;
        let (queue, queue_events) = TransferQueue::new(
            history,
            config
                .bg_transfer_interval_secs
                .map(std::time::Duration::from_secs),
        );

        let store = match encryption {
            Some(engine) => {
                ContentStore::encrypted(adapter.clone(), engine, config.chunked_format_threshold)
            }
            None => ContentStore::plaintext(adapter.clone()),
        };

        let local_store = IndexStore::new(config.local_index_path(), config.compress_index);
        let remote_store = IndexStore::new(config.remote_index_cache_path(), config.compress_index);
        let local_index = local_store.load().await?;
        let remote_index = remote_store.load().await?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(SyncContext {
            locks: MergeLockManager::new(adapter.clone(), &config.device_id),
            vault: Vault::new(vault_root),
            store: std::sync::RwLock::new(store),
            filter,
            dirty: DirtyTracker::new(),
            queue,
            local_index: Mutex::new(local_index),
            remote_index: Mutex::new(remote_index),
            local_store,
            remote_store,
            events,
            change_token: Mutex::new(None),
            scan_checkpoint: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            config,
        });

        recover_stale_pending_markers(&ctx).await;
        ctx.queue
            .start(Arc::new(QueueExecutor { ctx: ctx.clone() }))
            .await;

        let orchestrator = SyncOrchestrator {
            ctx,
            inner: Arc::new(Mutex::new(OrchestratorInner {
                state: SyncState::Idle,
                rerequest: None,
            })),
        };
        Ok((
            orchestrator,
            EngineEvents {
                sync: events_rx,
                transfers: queue_events,
            },
        ))
    }

    /// Claim the state machine for an exclusive non-cycle operation.
    pub(crate) async fn try_enter(&self, state: SyncState) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != SyncState::Idle {
            return false;
        }
        inner.state = state;
        true
    }

    pub(crate) async fn leave(&self) {
        self.inner.lock().await.state = SyncState::Idle;
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        self.ctx.emit(event);
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub async fn state(&self) -> SyncState {
        self.inner.lock().await.state
    }

    /// Host entry point. Returns `false` when the request was coalesced into
    /// an already-running cycle's trailing re-request.
    pub async fn request_sync(&self, request: SyncRequest) -> Result<bool, SyncError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SyncState::Idle {
                let merged = inner
                    .rerequest
                    .take()
                    .map(|prior| prior.merged_with(request))
                    .unwrap_or(request);
                inner.rerequest = Some(merged);
                // A running full scan yields at its next chunk boundary.
                self.ctx.interrupted.store(true, Ordering::SeqCst);
                debug!("sync request coalesced");
                return Ok(false);
            }
            inner.state = SyncState::Pulling;
        }

        let mut current = request;
        loop {
            let result = run_cycle(&self.ctx, &self.inner, &current).await;

            let next = {
                let mut inner = self.inner.lock().await;
                match (&result, inner.rerequest.take()) {
                    (Ok(_), Some(rerequest)) => {
                        inner.state = SyncState::Pulling;
                        Some(rerequest)
                    }
                    (_, maybe) => {
                        // Errors drop the trailing request: the host decides
                        // whether to retry after seeing the failure.
                        if maybe.is_some() {
                            debug!("dropping trailing request after cycle error");
                        }
                        inner.state = SyncState::Idle;
                        None
                    }
                }
            };

            if let Err(e) = &result {
                self.ctx.emit(SyncEvent::CycleFailed {
                    error: e.to_string(),
                });
            }
            result?;

            match next {
                Some(request) => current = request,
                None => break,
            }
        }
        Ok(true)
    }

    /// Stop the background worker. Indices are already persisted after every
    /// mutation, so shutdown is just the worker.
    pub async fn shutdown(&self) {
        self.ctx.queue.shutdown().await;
    }
}

/// On startup, a pending marker with no live queue behind it means the
/// process died between cycles: re-mark dirty and drop the marker.
async fn recover_stale_pending_markers(ctx: &Arc<SyncContext>) {
    let mut index = ctx.local_index.lock().await;
    let stale: Vec<String> = index
        .iter()
        .filter(|(_, entry)| entry.pending_transfer.is_some())
        .map(|(path, _)| path.clone())
        .collect();
    for path in stale {
        warn!(path = %path, "dropping stale pending-transfer marker");
        if let Some(entry) = index.get_mut(&path) {
            entry.pending_transfer = None;
        }
        ctx.dirty.mark(&path);
    }
}

async fn set_state(inner: &Arc<Mutex<OrchestratorInner>>, state: SyncState) {
    inner.lock().await.state = state;
}

async fn run_cycle(
    ctx: &Arc<SyncContext>,
    inner: &Arc<Mutex<OrchestratorInner>>,
    request: &SyncRequest,
) -> Result<(), SyncError> {
    info!(scan = request.scan_vault, "sync cycle starting");
    ctx.emit(SyncEvent::CycleStarted {
        scan: request.scan_vault,
    });
    ctx.interrupted.store(false, Ordering::SeqCst);

    ctx.queue.pause();
    let store = ctx.store();
    store.clear_cycle_cache().await;

    let result = run_cycle_inner(ctx, inner, request, &store).await;

    store.clear_cycle_cache().await;
    ctx.queue.resume();

    match &result {
        Ok(changed) => {
            info!(changed = *changed, "sync cycle finished");
            ctx.emit(SyncEvent::CycleCompleted { changed: *changed });
        }
        Err(e) => warn!(error = %e, "sync cycle failed"),
    }
    result.map(|_| ())
}

async fn run_cycle_inner(
    ctx: &Arc<SyncContext>,
    inner: &Arc<Mutex<OrchestratorInner>>,
    request: &SyncRequest,
    store: &ContentStore,
) -> Result<bool, SyncError> {
    // Change-feed short-circuit: when the provider can tell us nothing moved
    // and nothing is dirty locally, skip the listing entirely.
    if !request.scan_vault && ctx.dirty.is_empty() && store.adapter().supports_changes_api() {
        let token = ctx.change_token.lock().await.clone();
        if let Some(token) = token {
            if let Ok(set) = store.adapter().get_changes(&token).await {
                *ctx.change_token.lock().await = Some(set.new_token);
                if set.changes.is_empty() {
                    debug!("change feed empty and nothing dirty; short-circuiting");
                    return Ok(false);
                }
            }
        }
    }

    // One remote listing serves the whole cycle.
    let listing = store.adapter().list_files(None).await?;
    let remote_files: BTreeMap<String, RemoteRecord> = listing
        .into_iter()
        .filter(|record| record.kind == RemoteKind::File)
        .map(|record| (record.path.clone(), record))
        .collect();

    // Shared-index short-circuit: if the remote index file hasn't moved and
    // nothing is dirty locally, there is no work at all.
    let remote_index_record = remote_files.get(REMOTE_INDEX_PATH);
    let remote_index_hash = remote_index_record
        .and_then(|record| record.hash.as_deref())
        .map(hashing::normalize_digest);
    {
        let recorded = ctx
            .remote_index
            .lock()
            .await
            .get(REMOTE_INDEX_PATH)
            .map(|entry| entry.hash.clone());
        if !request.scan_vault
            && ctx.dirty.is_empty()
            && remote_index_hash.is_some()
            && remote_index_hash == recorded
        {
            debug!("remote index unchanged and nothing dirty; short-circuiting");
            return Ok(false);
        }
    }

    // Another device pushed: adopt its shared index before reconciling.
    if let (Some(record), Some(listing_hash)) = (remote_index_record, remote_index_hash.clone()) {
        let recorded = ctx
            .remote_index
            .lock()
            .await
            .get(REMOTE_INDEX_PATH)
            .map(|entry| entry.hash.clone());
        if recorded.as_deref() != Some(listing_hash.as_str()) {
            match store.download(&record.id).await {
                Ok(raw) => match SyncIndex::from_bytes(&raw) {
                    Ok(mut fetched) => {
                        // Close the self-reference: record the hash the
                        // listing reports for the document we just read.
                        if let Some(own) = fetched.get_mut(REMOTE_INDEX_PATH) {
                            own.hash = listing_hash.clone();
                        } else {
                            fetched.insert(
                                REMOTE_INDEX_PATH.to_string(),
                                index_entry_for_document(record, &raw, listing_hash.clone()),
                            );
                        }
                        *ctx.remote_index.lock().await = fetched;
                    }
                    Err(e) => warn!(error = %e, "remote index unreadable; keeping local copy"),
                },
                Err(e) => warn!(error = %e, "remote index download failed; keeping local copy"),
            }
        }
    }

    // Local view.
    if request.scan_vault {
        set_state(inner, SyncState::Scanning).await;
    }
    let local_files = ctx.vault.scan().await?;
    let local_hashes = collect_local_hashes(ctx, &local_files, request.scan_vault).await?;

    set_state(inner, SyncState::Pulling).await;

    let plan = {
        let local_index = ctx.local_index.lock().await;
        let remote_index = ctx.remote_index.lock().await;
        reconcile::reconcile(&ReconcileInput {
            local_files: &local_files,
            local_hashes: &local_hashes,
            remote_files: &remote_files,
            local_index: &local_index,
            remote_index: &remote_index,
            filter: &ctx.filter,
            encrypted: store.is_encrypted(),
        })
    };

    if plan.orphan_guard_tripped {
        let count = ctx.local_index.lock().await.len();
        if !request.is_silent {
            ctx.emit(SyncEvent::MassDeleteRefused { count });
        }
        return Err(SyncError::MassDeleteRefused { count });
    }

    let changed = !plan.is_noop();

    // Bookkeeping-only outcomes first; they unlock nothing downstream.
    apply_adoptions(ctx, &plan, &remote_files, &local_files).await;

    // Pull before push, merges in between.
    execute_pulls(ctx, store, &plan, &remote_files).await?;

    set_state(inner, SyncState::Merging).await;
    execute_merges(ctx, store, request, &plan, &remote_files).await?;

    set_state(inner, SyncState::Pushing).await;
    execute_deletes(ctx, store, &plan, &remote_files).await?;
    execute_pushes(ctx, store, &plan, &local_files, &remote_files).await?;

    ctx.persist_indices().await?;
    upload_remote_index(ctx, store).await?;

    // Keep the change token fresh for the next smart pull.
    if store.adapter().supports_changes_api() {
        if let Ok(token) = store.adapter().get_start_page_token().await {
            *ctx.change_token.lock().await = Some(token);
        }
    }

    Ok(changed)
}

fn index_entry_for_document(record: &RemoteRecord, raw: &[u8], hash: String) -> IndexEntry {
    IndexEntry {
        file_id: record.id.clone(),
        mtime_ms: record.mtime_ms,
        size: raw.len() as u64,
        hash,
        plain_hash: hashing::content_hash(raw),
        ancestor_hash: None,
        last_action: LastAction::Push,
        pending_transfer: None,
    }
}

/// Plaintext digests for every participating local file.
///
/// In smart mode the grace-window check skips re-hashing files whose size
/// and mtime match the index. A full scan hashes everything, checkpointing
/// progress so an interrupted scan resumes where it stopped.
async fn collect_local_hashes(
    ctx: &Arc<SyncContext>,
    local_files: &[LocalFile],
    full_scan: bool,
) -> Result<HashMap<String, String>, SyncError> {
    let mut hashes = HashMap::new();
    let local_index = ctx.local_index.lock().await;

    let mut resume_after: Option<String> = None;
    if full_scan {
        let mut checkpoint = ctx.scan_checkpoint.lock().await;
        if let Some(existing) = checkpoint.as_ref() {
            if now_ms() - existing.last_tick_ms <= SCAN_CHECKPOINT_TTL_MS {
                resume_after = Some(existing.cursor.clone());
            } else {
                debug!("full-scan checkpoint stale; restarting");
                *checkpoint = None;
            }
        }
    }

    let mut since_tick = 0usize;
    for file in local_files {
        if !ctx.filter.participates(&file.path) {
            continue;
        }
        let indexed = local_index.get(&file.path);

        let reuse_indexed = if full_scan {
            // Inside the resumed prefix, trust the quick check; beyond the
            // cursor everything is re-hashed.
            resume_after
                .as_deref()
                .is_some_and(|cursor| file.path.as_str() <= cursor)
                && indexed.is_some_and(|entry| {
                    quick_check_entry(file, entry) == QuickCheck::Identical
                })
        } else {
            indexed.is_some_and(|entry| quick_check_entry(file, entry) == QuickCheck::Identical)
        };

        if let (true, Some(entry)) = (reuse_indexed, indexed) {
            hashes.insert(file.path.clone(), entry.plain_hash.clone());
            continue;
        }

        let digest = hashing::hash_file(&ctx.vault.root().join(&file.path))
            .await
            .map_err(VaultError::from)?;
        hashes.insert(file.path.clone(), digest);

        if full_scan {
            since_tick += 1;
            if since_tick >= SCAN_CHUNK {
                since_tick = 0;
                *ctx.scan_checkpoint.lock().await = Some(ScanCheckpoint {
                    cursor: file.path.clone(),
                    last_tick_ms: now_ms(),
                });
                if ctx.interrupted.load(Ordering::SeqCst) {
                    debug!(cursor = %file.path, "full scan yielding to a new request");
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    if full_scan && !ctx.interrupted.load(Ordering::SeqCst) {
        *ctx.scan_checkpoint.lock().await = None;
    }
    Ok(hashes)
}

fn quick_check_entry(file: &LocalFile, entry: &IndexEntry) -> QuickCheck {
    reconcile::quick_check(file.size, file.mtime_ms, entry)
}

async fn apply_adoptions(
    ctx: &Arc<SyncContext>,
    plan: &ReconcilePlan,
    remote_files: &BTreeMap<String, RemoteRecord>,
    local_files: &[LocalFile],
) {
    if plan.adopt.is_empty() && plan.reindex.is_empty() {
        return;
    }
    let locals: HashMap<&str, &LocalFile> =
        local_files.iter().map(|f| (f.path.as_str(), f)).collect();
    let mut local_index = ctx.local_index.lock().await;
    let mut remote_index = ctx.remote_index.lock().await;

    for adoption in plan.adopt.iter().chain(plan.reindex.iter()) {
        let Some(record) = remote_files.get(&adoption.path) else {
            continue;
        };
        let Some(local) = locals.get(adoption.path.as_str()) else {
            continue;
        };
        let entry = IndexEntry {
            file_id: record.id.clone(),
            mtime_ms: local.mtime_ms,
            size: local.size,
            hash: record
                .hash
                .as_deref()
                .map(hashing::normalize_digest)
                .unwrap_or_default(),
            plain_hash: adoption.plain_hash.clone(),
            ancestor_hash: Some(adoption.plain_hash.clone()),
            last_action: LastAction::Pull,
            pending_transfer: None,
        };
        debug!(path = %adoption.path, "adopted without transfer");
        local_index.insert(adoption.path.clone(), entry.clone());
        remote_index.insert(adoption.path.clone(), entry);
        ctx.dirty.clear(&adoption.path);
    }
}

async fn execute_pulls(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    plan: &ReconcilePlan,
    remote_files: &BTreeMap<String, RemoteRecord>,
) -> Result<(), SyncError> {
    for path in &plan.download {
        let Some(record) = remote_files.get(path) else {
            continue;
        };

        if record.size >= ctx.config.large_file_threshold {
            defer_pull(ctx, path, record).await;
            continue;
        }

        let inline_id = ctx
            .queue
            .mark_inline_start(path, TransferDirection::Pull)
            .await;
        let result = pull_file(ctx, store, path, record).await;
        ctx.queue.mark_inline_end(inline_id).await;
        result?;
    }

    for path in &plan.delete_local {
        info!(path = %path, "removing local file deleted remotely");
        ctx.vault.remove(path).await?;
        ctx.local_index.lock().await.remove(path);
        ctx.remote_index.lock().await.remove(path);
        ctx.dirty.clear(path);
    }
    Ok(())
}

/// Download and write one file, recording the new common state.
async fn pull_file(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    path: &str,
    record: &RemoteRecord,
) -> Result<(), SyncError> {
    let content = store.download(&record.id).await?;
    ctx.vault.write_atomic(path, &content).await?;
    let stat = ctx.vault.stat(path).await?;
    let (mtime_ms, size) = stat.unwrap_or((record.mtime_ms, content.len() as u64));

    let plain_hash = hashing::content_hash(&content);
    let entry = IndexEntry::pulled(
        record.id.clone(),
        mtime_ms,
        size,
        record.hash.clone().unwrap_or_else(|| plain_hash.clone()),
        plain_hash,
    );
    ctx.local_index
        .lock()
        .await
        .insert(path.to_string(), entry.clone());
    ctx.remote_index.lock().await.insert(path.to_string(), entry);
    ctx.dirty.clear(path);

    if let Err(e) = merge::store_baseline(&ctx.config, &content).await {
        warn!(path, error = %e, "failed to store merge baseline");
    }
    debug!(path, "pulled");
    Ok(())
}

async fn defer_pull(ctx: &Arc<SyncContext>, path: &str, record: &RemoteRecord) {
    debug!(path, size = record.size, "deferring large download");
    mark_pending(
        ctx,
        path,
        TransferDirection::Pull,
        record.hash.as_deref().unwrap_or_default(),
    )
    .await;
    ctx.queue
        .enqueue(TransferRequest {
            direction: TransferDirection::Pull,
            path: path.to_string(),
            size: record.size,
            priority: TransferPriority::Normal,
            content: None,
            mtime_ms: Some(record.mtime_ms),
            snapshot_hash: None,
            remote_hash: record.hash.as_deref().map(hashing::normalize_digest),
            file_id: Some(record.id.clone()),
        })
        .await;
}

async fn execute_merges(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    request: &SyncRequest,
    plan: &ReconcilePlan,
    remote_files: &BTreeMap<String, RemoteRecord>,
) -> Result<(), SyncError> {
    for path in &plan.merge {
        let Some(record) = remote_files.get(path) else {
            continue;
        };
        merge_path(ctx, store, request, path, record).await?;
    }
    Ok(())
}

async fn merge_path(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    request: &SyncRequest,
    path: &str,
    record: &RemoteRecord,
) -> Result<(), SyncError> {
    if !ctx.locks.acquire(path).await? {
        let status = ctx.locks.check(path).await?;
        debug!(path, holder = ?status.holder, "merge deferred: lock held elsewhere");
        ctx.dirty.mark(path);
        if !request.is_silent {
            ctx.emit(SyncEvent::MergeDeferred {
                path: path.to_string(),
                holder: status.holder,
            });
        }
        return Ok(());
    }

    let result = merge_path_locked(ctx, store, request, path, record).await;
    if let Err(e) = ctx.locks.release(path).await {
        warn!(path, error = %e, "merge lock release failed");
    }
    result
}

async fn merge_path_locked(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    request: &SyncRequest,
    path: &str,
    record: &RemoteRecord,
) -> Result<(), SyncError> {
    let local = ctx.vault.read(path).await?;
    let remote = store.download(&record.id).await?;

    let ancestor_hash = ctx
        .local_index
        .lock()
        .await
        .get(path)
        .and_then(|entry| entry.ancestor_hash.clone());
    let ancestor =
        merge::resolve_ancestor(store, &ctx.config, path, ancestor_hash.as_deref()).await;

    match merge::decide(&local, &remote, ancestor.as_deref()) {
        MergeDecision::CleanMerge(content) => {
            info!(path, "line merge clean");
            ctx.vault.write_atomic(path, &content).await?;
            // Merge results always push inline, never through the queue.
            push_file(ctx, store, path, content, LastAction::Merge).await?;
        }
        MergeDecision::AcceptRemote => {
            info!(path, "local content contained in remote; pulling");
            pull_file(ctx, store, path, record).await?;
        }
        MergeDecision::AcceptLocal => {
            info!(path, "remote content contained in local; pushing");
            push_file(ctx, store, path, local, LastAction::Merge).await?;
        }
        MergeDecision::ConflictRename => {
            let conflict_path =
                merge::conflict_rename_path(path, chrono::Utc::now().date_naive());
            info!(path, conflict_path = %conflict_path, "conflicting edits; keeping both");
            ctx.vault.write_atomic(&conflict_path, &local).await?;
            pull_file(ctx, store, path, record).await?;
            // The conflict copy is a brand-new local file; the next cycle
            // pushes it like any other.
            ctx.dirty.mark(&conflict_path);
            if !request.is_silent {
                ctx.emit(SyncEvent::ConflictRenamed {
                    path: path.to_string(),
                    conflict_path,
                });
            }
        }
    }
    Ok(())
}

async fn execute_deletes(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    plan: &ReconcilePlan,
    remote_files: &BTreeMap<String, RemoteRecord>,
) -> Result<(), SyncError> {
    for path in &plan.delete_remote {
        let Some(record) = remote_files.get(path) else {
            continue;
        };
        info!(path = %path, "deleting remote file");
        store.adapter().delete_file(&record.id).await?;
        ctx.local_index.lock().await.remove(path);
        ctx.remote_index.lock().await.remove(path);
    }
    Ok(())
}

async fn execute_pushes(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    plan: &ReconcilePlan,
    local_files: &[LocalFile],
    remote_files: &BTreeMap<String, RemoteRecord>,
) -> Result<(), SyncError> {
    let locals: HashMap<&str, &LocalFile> =
        local_files.iter().map(|f| (f.path.as_str(), f)).collect();

    for path in &plan.upload {
        let size = locals.get(path.as_str()).map(|f| f.size).unwrap_or(0);

        if size >= ctx.config.large_file_threshold {
            defer_push(ctx, path, remote_files.get(path)).await?;
            continue;
        }

        let inline_id = ctx
            .queue
            .mark_inline_start(path, TransferDirection::Push)
            .await;
        let content = ctx.vault.read(path).await?;
        let result = push_file(ctx, store, path, content, LastAction::Push).await;
        ctx.queue.mark_inline_end(inline_id).await;
        result?;
    }
    Ok(())
}

/// Upload one file and record the new common state.
async fn push_file(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
    path: &str,
    content: Vec<u8>,
    action: LastAction,
) -> Result<(), SyncError> {
    let existing_id = ctx
        .local_index
        .lock()
        .await
        .get(path)
        .map(|entry| entry.file_id.clone())
        .filter(|id| !id.is_empty());

    let stat = ctx.vault.stat(path).await?;
    let (mtime_ms, size) = stat.unwrap_or((now_ms(), content.len() as u64));

    let record = store
        .upload(path, &content, mtime_ms, existing_id.as_deref())
        .await?;

    let plain_hash = hashing::content_hash(&content);
    let entry = IndexEntry {
        file_id: record.id.clone(),
        mtime_ms,
        size,
        hash: record
            .hash
            .as_deref()
            .map(hashing::normalize_digest)
            .unwrap_or_else(|| plain_hash.clone()),
        plain_hash: plain_hash.clone(),
        ancestor_hash: Some(plain_hash),
        last_action: action,
        pending_transfer: None,
    };
    ctx.local_index
        .lock()
        .await
        .insert(path.to_string(), entry.clone());
    ctx.remote_index.lock().await.insert(path.to_string(), entry);
    ctx.dirty.clear(path);

    if let Err(e) = merge::store_baseline(&ctx.config, &content).await {
        warn!(path, error = %e, "failed to store merge baseline");
    }
    debug!(path, "pushed");
    Ok(())
}

async fn defer_push(
    ctx: &Arc<SyncContext>,
    path: &str,
    remote: Option<&RemoteRecord>,
) -> Result<(), SyncError> {
    let content = ctx.vault.read(path).await?;
    let stat = ctx.vault.stat(path).await?;
    let (mtime_ms, size) = stat.unwrap_or((now_ms(), content.len() as u64));
    let snapshot_hash = hashing::content_hash(&content);

    debug!(path, size, "deferring large upload");
    mark_pending(ctx, path, TransferDirection::Push, &snapshot_hash).await;
    ctx.queue
        .enqueue(TransferRequest {
            direction: TransferDirection::Push,
            path: path.to_string(),
            size,
            priority: TransferPriority::Normal,
            content: Some(content),
            mtime_ms: Some(mtime_ms),
            snapshot_hash: Some(snapshot_hash),
            remote_hash: remote
                .and_then(|r| r.hash.as_deref())
                .map(hashing::normalize_digest),
            file_id: remote.map(|r| r.id.clone()),
        })
        .await;
    Ok(())
}

/// Set the pending-transfer marker, creating a provisional entry for paths
/// that have never been synced.
async fn mark_pending(
    ctx: &Arc<SyncContext>,
    path: &str,
    direction: TransferDirection,
    snapshot_hash: &str,
) {
    let pending = PendingTransfer {
        direction,
        snapshot_hash: snapshot_hash.to_string(),
        enqueued_at_ms: now_ms(),
    };
    let mut index = ctx.local_index.lock().await;
    match index.get_mut(path) {
        Some(entry) => entry.pending_transfer = Some(pending),
        None => {
            index.insert(
                path.to_string(),
                IndexEntry {
                    file_id: String::new(),
                    mtime_ms: 0,
                    size: 0,
                    hash: String::new(),
                    plain_hash: snapshot_hash.to_string(),
                    ancestor_hash: None,
                    last_action: LastAction::Push,
                    pending_transfer: Some(pending),
                },
            );
        }
    }
}

async fn clear_pending(ctx: &Arc<SyncContext>, path: &str) {
    let mut index = ctx.local_index.lock().await;
    let remove = match index.get_mut(path) {
        Some(entry) => {
            entry.pending_transfer = None;
            // Provisional entries exist only to carry the marker.
            entry.file_id.is_empty()
        }
        None => false,
    };
    if remove {
        index.remove(path);
    }
}

/// Upload the shared index. Two writes: the first stores the entries, the
/// second records the first write's server hash inside the document's own
/// entry. Locally we keep the hash of the second write, which is what the
/// next listing will report.
async fn upload_remote_index(
    ctx: &Arc<SyncContext>,
    store: &ContentStore,
) -> Result<(), SyncError> {
    let existing_id = ctx
        .remote_index
        .lock()
        .await
        .get(REMOTE_INDEX_PATH)
        .map(|entry| entry.file_id.clone())
        .filter(|id| !id.is_empty());

    let payload = ctx.remote_index.lock().await.to_bytes()?;
    let first = store
        .upload(REMOTE_INDEX_PATH, &payload, now_ms(), existing_id.as_deref())
        .await?;
    let first_hash = first
        .hash
        .as_deref()
        .map(hashing::normalize_digest)
        .unwrap_or_default();

    {
        let mut remote_index = ctx.remote_index.lock().await;
        remote_index.insert(
            REMOTE_INDEX_PATH.to_string(),
            index_entry_for_document(&first, &payload, first_hash),
        );
    }

    let payload = ctx.remote_index.lock().await.to_bytes()?;
    let second = store
        .upload(REMOTE_INDEX_PATH, &payload, now_ms(), Some(&first.id))
        .await?;
    let second_hash = second
        .hash
        .as_deref()
        .map(hashing::normalize_digest)
        .unwrap_or_default();

    {
        let mut remote_index = ctx.remote_index.lock().await;
        remote_index.insert(
            REMOTE_INDEX_PATH.to_string(),
            index_entry_for_document(&second, &payload, second_hash),
        );
    }
    ctx.persist_indices().await?;
    debug!("remote index uploaded");
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Background execution
// ---------------------------------------------------------------------------

/// Executes deferred queue items against the live context.
pub struct QueueExecutor {
    ctx: Arc<SyncContext>,
}

#[async_trait::async_trait]
impl TransferExecutor for QueueExecutor {
    async fn execute(&self, item: &TransferItem) -> ExecuteOutcome {
        match item.direction {
            TransferDirection::Push => self.execute_push(item).await,
            TransferDirection::Pull => self.execute_pull(item).await,
        }
    }
}

impl QueueExecutor {
    async fn execute_push(&self, item: &TransferItem) -> ExecuteOutcome {
        let ctx = &self.ctx;
        let store = ctx.store();

        // Staleness: the file may have moved on since enqueue.
        let stat = match ctx.vault.stat(&item.path).await {
            Ok(stat) => stat,
            Err(e) => {
                return ExecuteOutcome::Failed {
                    error: e.to_string(),
                    transient: false,
                }
            }
        };
        let Some((mtime_ms, _size)) = stat else {
            clear_pending(ctx, &item.path).await;
            ctx.dirty.mark(&item.path);
            return ExecuteOutcome::Cancelled {
                reason: "file removed before upload".to_string(),
            };
        };

        let mut content = item.content.clone().unwrap_or_default();
        if item.mtime_ms != Some(mtime_ms) {
            let reread = match ctx.vault.read(&item.path).await {
                Ok(reread) => reread,
                Err(e) => {
                    return ExecuteOutcome::Failed {
                        error: e.to_string(),
                        transient: false,
                    }
                }
            };
            let new_hash = hashing::content_hash(&reread);
            if Some(new_hash.as_str()) != item.snapshot_hash.as_deref() {
                clear_pending(ctx, &item.path).await;
                ctx.dirty.mark(&item.path);
                let _ = ctx.persist_indices().await;
                return ExecuteOutcome::Cancelled {
                    reason: "content changed since enqueue".to_string(),
                };
            }
            content = reread;
        }

        // Remote conflict: someone pushed while this item waited.
        let known_hash = ctx
            .local_index
            .lock()
            .await
            .get(&item.path)
            .map(|entry| entry.hash.clone());
        let remote_meta = match &item.file_id {
            Some(id) => store
                .adapter()
                .get_file_metadata_by_id(id, Some(&item.path))
                .await,
            None => store.adapter().get_file_metadata(&item.path).await,
        };
        match remote_meta {
            Ok(Some(meta)) => {
                let remote_hash = meta.hash.as_deref().map(hashing::normalize_digest);
                let mismatch = match (&remote_hash, &known_hash) {
                    (Some(remote), Some(known)) if !known.is_empty() => remote != known,
                    (Some(_), _) => item.file_id.is_none(),
                    _ => false,
                };
                if mismatch {
                    clear_pending(ctx, &item.path).await;
                    ctx.dirty.mark(&item.path);
                    let _ = ctx.persist_indices().await;
                    return ExecuteOutcome::Cancelled {
                        reason: "remote changed since enqueue; merge owed".to_string(),
                    };
                }
            }
            Ok(None) => {}
            Err(e) => {
                return ExecuteOutcome::Failed {
                    transient: e.is_transient(),
                    error: e.to_string(),
                }
            }
        }

        let previous_ancestor = ctx
            .local_index
            .lock()
            .await
            .get(&item.path)
            .and_then(|entry| entry.ancestor_hash.clone());

        let record = match store
            .upload(&item.path, &content, mtime_ms, item.file_id.as_deref())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                let transient = match &e {
                    ContentStoreError::Adapter(inner) => inner.is_transient(),
                    _ => false,
                };
                return ExecuteOutcome::Failed {
                    error: e.to_string(),
                    transient,
                };
            }
        };

        let plain_hash = hashing::content_hash(&content);
        let entry = IndexEntry {
            file_id: record.id.clone(),
            mtime_ms,
            size: content.len() as u64,
            hash: record
                .hash
                .as_deref()
                .map(hashing::normalize_digest)
                .unwrap_or_else(|| plain_hash.clone()),
            plain_hash: plain_hash.clone(),
            ancestor_hash: Some(previous_ancestor.unwrap_or(plain_hash)),
            last_action: LastAction::Push,
            pending_transfer: None,
        };
        ctx.local_index
            .lock()
            .await
            .insert(item.path.clone(), entry.clone());
        ctx.remote_index
            .lock()
            .await
            .insert(item.path.clone(), entry);
        ctx.dirty.clear(&item.path);
        if let Err(e) = ctx.persist_indices().await {
            warn!(error = %e, "index persistence after deferred push failed");
        }
        ExecuteOutcome::Completed
    }

    async fn execute_pull(&self, item: &TransferItem) -> ExecuteOutcome {
        let ctx = &self.ctx;
        let store = ctx.store();

        if ctx.dirty.is_dirty(&item.path) {
            clear_pending(ctx, &item.path).await;
            let _ = ctx.persist_indices().await;
            return ExecuteOutcome::Cancelled {
                reason: "local edits pending; merge owed".to_string(),
            };
        }

        let Some(file_id) = &item.file_id else {
            return ExecuteOutcome::Failed {
                error: "pull item without file id".to_string(),
                transient: false,
            };
        };

        let content = match store.download(file_id).await {
            Ok(content) => content,
            Err(e) => {
                let transient = match &e {
                    ContentStoreError::Adapter(inner) => inner.is_transient(),
                    _ => false,
                };
                return ExecuteOutcome::Failed {
                    error: e.to_string(),
                    transient,
                };
            }
        };

        if let Err(e) = ctx.vault.write_atomic(&item.path, &content).await {
            return ExecuteOutcome::Failed {
                error: e.to_string(),
                transient: false,
            };
        }

        let stat = ctx.vault.stat(&item.path).await.ok().flatten();
        let (mtime_ms, size) = stat.unwrap_or((now_ms(), content.len() as u64));
        let plain_hash = hashing::content_hash(&content);
        let entry = IndexEntry::pulled(
            file_id.clone(),
            mtime_ms,
            size,
            item.remote_hash.clone().unwrap_or_else(|| plain_hash.clone()),
            plain_hash,
        );
        ctx.local_index
            .lock()
            .await
            .insert(item.path.clone(), entry.clone());
        ctx.remote_index
            .lock()
            .await
            .insert(item.path.clone(), entry);
        if let Err(e) = ctx.persist_indices().await {
            warn!(error = %e, "index persistence after deferred pull failed");
        }
        ExecuteOutcome::Completed
    }
}
