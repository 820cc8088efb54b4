// Migration of a plaintext vault to end-to-end encryption.
//
// The encrypted copy is built in full under a shadow prefix while the
// original stays untouched; only after the shadow holds every file, the
// vault key blob and a fresh shared index does the swap move the plaintext
// tree into a dated backup and the shadow into its place. A sentinel file
// serializes migrations across devices. Failure before the swap leaves the
// original vault exactly as it was.

use crate::config::{MIGRATION_LOCK_PATH, VAULT_LOCK_PATH};
use crate::encrypted_adapter::ContentStore;
use crate::encryption::EncryptionEngine;
use crate::hashing;
use crate::index::{IndexEntry, LastAction, SyncIndex};
use crate::sync::{SyncError, SyncEvent, SyncOrchestrator, SyncState};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const SHADOW_PREFIX: &str = "migration/shadow";
const BACKUP_PREFIX: &str = "migration/backup";
/// Another device's sentinel younger than this blocks us.
const MIGRATION_LOCK_TTL_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Serialize, Deserialize)]
struct MigrationLock {
    device_id: String,
    ts_ms: i64,
}

/// Convert the vault to encrypted form.
///
/// `engine` is built from the freshly initialized vault key; `vault_lock_blob`
/// is the opaque wrapped-key blob the unlock flow produced (key derivation is
/// the host's concern).
pub async fn migrate_to_encrypted(
    orchestrator: &SyncOrchestrator,
    engine: EncryptionEngine,
    vault_lock_blob: Vec<u8>,
) -> Result<(), SyncError> {
    if !orchestrator.try_enter(SyncState::Migrating).await {
        return Err(SyncError::Busy("a sync cycle is running"));
    }
    orchestrator.context().queue.pause();

    let result = migrate_inner(orchestrator, engine, vault_lock_blob).await;

    orchestrator.context().queue.resume();
    orchestrator.leave().await;

    match &result {
        Ok(()) => {
            info!("vault migration to encrypted form completed");
            orchestrator.emit(SyncEvent::MigrationCompleted);
        }
        Err(e) => {
            warn!(error = %e, "vault migration aborted");
            if let SyncError::MigrationRefused(reason) = e {
                orchestrator.emit(SyncEvent::MigrationRefused {
                    reason: reason.clone(),
                });
            }
        }
    }
    result
}

async fn migrate_inner(
    orchestrator: &SyncOrchestrator,
    engine: EncryptionEngine,
    vault_lock_blob: Vec<u8>,
) -> Result<(), SyncError> {
    let ctx = orchestrator.context();
    let adapter = ctx.store().adapter().clone();
    let now = now_ms();

    // Preconditions.
    if adapter.get_file_metadata(VAULT_LOCK_PATH).await?.is_some() {
        return Err(SyncError::MigrationRefused(
            "vault is already encrypted".to_string(),
        ));
    }
    if let Some(record) = adapter.get_file_metadata(MIGRATION_LOCK_PATH).await? {
        let raw = adapter.download_file(&record.id).await?;
        if let Ok(lock) = serde_json::from_slice::<MigrationLock>(&raw) {
            if lock.device_id != ctx.config.device_id && now - lock.ts_ms < MIGRATION_LOCK_TTL_MS {
                return Err(SyncError::MigrationRefused(format!(
                    "device {} started a migration recently",
                    lock.device_id
                )));
            }
        }
    }

    // Take the sentinel.
    let lock = MigrationLock {
        device_id: ctx.config.device_id.clone(),
        ts_ms: now,
    };
    let lock_existing = adapter
        .get_file_metadata(MIGRATION_LOCK_PATH)
        .await?
        .map(|r| r.id);
    adapter
        .upload_file(
            MIGRATION_LOCK_PATH,
            &serde_json::to_vec(&lock).map_err(crate::index::IndexError::from)?,
            now,
            lock_existing.as_deref(),
        )
        .await?;

    let result = build_and_swap(ctx, &engine, vault_lock_blob).await;

    // The sentinel comes off on success and failure alike.
    if let Ok(Some(record)) = adapter.get_file_metadata(MIGRATION_LOCK_PATH).await {
        if let Err(e) = adapter.delete_file(&record.id).await {
            warn!(error = %e, "failed to remove migration sentinel");
        }
    }
    result
}

async fn build_and_swap(
    ctx: &std::sync::Arc<crate::sync::SyncContext>,
    engine: &EncryptionEngine,
    vault_lock_blob: Vec<u8>,
) -> Result<(), SyncError> {
    let adapter = ctx.store().adapter().clone();
    let encrypted = ContentStore::encrypted(
        adapter.clone(),
        engine.clone(),
        ctx.config.chunked_format_threshold,
    );

    adapter.create_folder(SHADOW_PREFIX).await?;

    // Re-upload every local file, encrypted, into the shadow tree.
    let local_files = ctx.vault.scan().await?;
    let mut new_index = SyncIndex::new();
    for file in &local_files {
        if !ctx.filter.participates(&file.path) {
            continue;
        }
        let content = ctx.vault.read(&file.path).await?;
        let shadow_path = format!("{SHADOW_PREFIX}/{}", file.path);
        let record = encrypted
            .upload(&shadow_path, &content, file.mtime_ms, None)
            .await?;

        let plain_hash = hashing::content_hash(&content);
        new_index.insert(
            file.path.clone(),
            IndexEntry {
                file_id: record.id.clone(),
                mtime_ms: file.mtime_ms,
                size: file.size,
                hash: record
                    .hash
                    .as_deref()
                    .map(hashing::normalize_digest)
                    .unwrap_or_else(|| plain_hash.clone()),
                plain_hash: plain_hash.clone(),
                ancestor_hash: Some(plain_hash),
                last_action: LastAction::Push,
                pending_transfer: None,
            },
        );
        info!(path = %file.path, "migrated into shadow");
    }

    // Vault key blob and the fresh shared index ride along in the shadow.
    adapter
        .upload_file(
            &format!("{SHADOW_PREFIX}/{VAULT_LOCK_PATH}"),
            &vault_lock_blob,
            now_ms(),
            None,
        )
        .await?;
    encrypted
        .upload(
            &format!("{SHADOW_PREFIX}/{}", crate::config::REMOTE_INDEX_PATH),
            &new_index.to_bytes()?,
            now_ms(),
            None,
        )
        .await?;

    // Swap. The adapter contract has no whole-vault rename, so the swap is
    // two move passes: originals into a dated backup, then the shadow into
    // the canonical paths. Everything up to here left the originals alone.
    let backup_prefix = format!("{BACKUP_PREFIX}-{}", chrono::Utc::now().format("%Y-%m-%d"));
    adapter.create_folder(&backup_prefix).await?;

    let listing = adapter.list_files(None).await?;
    for record in &listing {
        // The shadow tree stays put and the sentinel outlives the swap.
        if record.path.starts_with("migration/") || record.path == MIGRATION_LOCK_PATH {
            continue;
        }
        let (parent, name) = split_path(&record.path);
        let backup_parent = if parent.is_empty() {
            backup_prefix.clone()
        } else {
            format!("{backup_prefix}/{parent}")
        };
        adapter
            .move_file(&record.id, name, Some(&backup_parent))
            .await?;
    }

    let shadow_files = adapter.list_files(Some(SHADOW_PREFIX)).await?;
    for record in &shadow_files {
        let canonical = &record.path[SHADOW_PREFIX.len() + 1..];
        let (parent, name) = split_path(canonical);
        adapter
            .move_file(
                &record.id,
                name,
                Some(if parent.is_empty() { "" } else { parent }),
            )
            .await?;
    }

    // From here on the engine speaks ciphertext.
    ctx.replace_store(encrypted);
    *ctx.local_index.lock().await = new_index.clone();
    *ctx.remote_index.lock().await = new_index;
    ctx.persist_indices().await?;
    adapter.reset().await?;
    Ok(())
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
