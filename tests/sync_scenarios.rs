// End-to-end sync behavior over the in-memory remote.

mod support;

use std::time::Duration;
use support::{DeviceOptions, TestDevice};
use vaultsync::adapter::memory::InMemoryAdapter;
use vaultsync::adapter::Adapter;
use vaultsync::encryption::format;
use vaultsync::hashing;
use vaultsync::index::{LastAction, TransferDirection};
use vaultsync::sync::{SyncEvent, SyncError};
use vaultsync::transfer_history::TransferOutcome;
use vaultsync::EncryptionEngine;

#[tokio::test]
async fn test_identical_unindexed_file_is_adopted_without_transfer() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    adapter
        .upload_file("notes/a.md", b"hello", 1_000, None)
        .await
        .unwrap();

    let device = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;
    device.write("notes/a.md", b"hello").await;
    device.sync().await;

    let entry = device.entry("notes/a.md").await.expect("entry missing");
    assert_eq!(
        entry.ancestor_hash.as_deref(),
        Some("5d41402abc4b2a76b9719d911017c592")
    );
    // No second upload happened: the file has no revisions.
    assert!(adapter.list_revisions("notes/a.md").await.unwrap().is_empty());
    assert_eq!(device.read("notes/a.md").await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_new_local_file_pushes() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;

    device.write("docs/x.md", b"v1").await;
    device.sync().await;

    assert_eq!(adapter.file_content("docs/x.md").await.unwrap(), b"v1");
    let entry = device.entry("docs/x.md").await.unwrap();
    assert_eq!(entry.last_action, LastAction::Push);
    assert_eq!(entry.hash, hashing::content_hash(b"v1"));
    assert_eq!(entry.plain_hash, entry.hash);
}

#[tokio::test]
async fn test_new_remote_file_pulls() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let writer = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;
    writer.write("n.md", b"shared note\n").await;
    writer.sync().await;

    let reader = TestDevice::new(&adapter, DeviceOptions::named("device-b")).await;
    reader.sync().await;

    assert_eq!(reader.read("n.md").await.unwrap(), b"shared note\n");
    let entry = reader.entry("n.md").await.unwrap();
    assert_eq!(entry.last_action, LastAction::Pull);
    assert_eq!(entry.ancestor_hash.as_deref(), Some(entry.plain_hash.as_str()));
}

#[tokio::test]
async fn test_concurrent_disjoint_edits_merge_line_level() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device_a = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;
    let device_b = TestDevice::new(&adapter, DeviceOptions::named("device-b")).await;

    // Both devices share the baseline.
    device_a.write("n.md", b"A\nB\nC\n").await;
    device_a.sync().await;
    device_b.sync().await;
    assert_eq!(device_b.read("n.md").await.unwrap(), b"A\nB\nC\n");

    // Divergent edits on different lines.
    device_a.write("n.md", b"A\nB1\nC\n").await;
    device_a.sync().await;
    device_b.write("n.md", b"A\nB\nC2\n").await;
    device_b.sync().await;

    assert_eq!(device_b.read("n.md").await.unwrap(), b"A\nB1\nC2\n");
    let entry = device_b.entry("n.md").await.unwrap();
    assert_eq!(entry.last_action, LastAction::Merge);
    assert_eq!(
        adapter.file_content("n.md").await.unwrap(),
        b"A\nB1\nC2\n",
        "merged result was pushed back"
    );

    // The first device converges on its next cycle.
    device_a.sync().await;
    assert_eq!(device_a.read("n.md").await.unwrap(), b"A\nB1\nC2\n");
}

#[tokio::test]
async fn test_same_line_edits_keep_both_via_conflict_rename() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device_a = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;
    let mut device_b = TestDevice::new(&adapter, DeviceOptions::named("device-b")).await;

    device_a.write("n.md", b"A\nB\nC\n").await;
    device_a.sync().await;
    device_b.sync().await;

    device_a.write("n.md", b"A\nB1\nC\n").await;
    device_a.sync().await;
    device_b.write("n.md", b"A\nB2\nC\n").await;
    device_b.sync().await;

    // Remote version landed at the original path.
    assert_eq!(device_b.read("n.md").await.unwrap(), b"A\nB1\nC\n");

    // The local version survives under a conflict name.
    let paths = device_b.local_paths().await;
    let conflict = paths
        .iter()
        .find(|p| p.contains("(Conflict "))
        .expect("conflict sibling missing");
    assert!(conflict.starts_with("n (Conflict "));
    assert!(conflict.ends_with(".md"));
    assert_eq!(device_b.read(conflict).await.unwrap(), b"A\nB2\nC\n");

    let mut saw_notice = false;
    while let Ok(event) = device_b.events.sync.try_recv() {
        if matches!(event, SyncEvent::ConflictRenamed { .. }) {
            saw_notice = true;
        }
    }
    assert!(saw_notice, "conflict notice missing");

    // Next cycle pushes the conflict copy to the remote.
    device_b.sync().await;
    assert_eq!(
        adapter.file_content(conflict).await.unwrap(),
        b"A\nB2\nC\n"
    );
}

#[tokio::test]
async fn test_large_file_defers_to_queue() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device = TestDevice::new(
        &adapter,
        DeviceOptions::named("device-a").with_threshold(1024),
    )
    .await;
    let queue = &device.orchestrator.context().queue;

    // Keep the worker gated so the deferred state is observable.
    queue.set_online(false);

    let big = vec![7u8; 2048];
    device.write("big.bin", &big).await;
    device.sync().await;

    assert!(adapter.file_content("big.bin").await.is_none());
    assert_eq!(queue.pending_len().await, 1);
    let entry = device.entry("big.bin").await.unwrap();
    let pending = entry.pending_transfer.expect("pending marker missing");
    assert_eq!(pending.direction, TransferDirection::Push);
    assert_eq!(pending.snapshot_hash, hashing::content_hash(&big));

    queue.set_online(true);
    device.drain_queue().await;

    assert_eq!(adapter.file_content("big.bin").await.unwrap(), big);
    let entry = device.entry("big.bin").await.unwrap();
    assert!(entry.pending_transfer.is_none());
    assert_eq!(entry.last_action, LastAction::Push);

    let history = queue.history();
    let history = history.lock().await;
    let record = history
        .list()
        .into_iter()
        .find(|r| r.path == "big.bin")
        .unwrap();
    assert_eq!(record.outcome, TransferOutcome::Completed);
}

#[tokio::test]
async fn test_stale_snapshot_cancels_deferred_push() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device = TestDevice::new(
        &adapter,
        DeviceOptions::named("device-a").with_threshold(1024),
    )
    .await;
    let queue = &device.orchestrator.context().queue;
    queue.set_online(false);

    device.write("big.bin", &vec![1u8; 2048]).await;
    device.sync().await;
    assert_eq!(queue.pending_len().await, 1);

    // Overwrite before the queue drains; the mtime moves past the snapshot.
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.write("big.bin", &vec![2u8; 2048]).await;

    queue.set_online(true);
    device.drain_queue().await;

    assert!(
        adapter.file_content("big.bin").await.is_none(),
        "stale snapshot must not upload"
    );
    let history = queue.history();
    let history = history.lock().await;
    let record = history
        .list()
        .into_iter()
        .find(|r| r.path == "big.bin")
        .unwrap();
    assert_eq!(record.outcome, TransferOutcome::Cancelled);
    assert!(device.orchestrator.context().dirty.is_dirty("big.bin"));

    // The next cycle pushes the fresh content.
    device.sync().await;
    device.drain_queue().await;
    assert_eq!(adapter.file_content("big.bin").await.unwrap(), vec![2u8; 2048]);
}

#[tokio::test]
async fn test_local_delete_propagates_to_remote() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device_a = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;
    let device_b = TestDevice::new(&adapter, DeviceOptions::named("device-b")).await;

    device_a.write("gone.md", b"bye").await;
    device_a.write("stays.md", b"hi").await;
    device_a.sync().await;
    device_b.sync().await;

    tokio::fs::remove_file(
        device_a
            .orchestrator
            .context()
            .vault
            .root()
            .join("gone.md"),
    )
    .await
    .unwrap();
    device_a.sync().await;
    assert!(adapter.file_content("gone.md").await.is_none());

    // The other device drops its copy on the next cycle.
    device_b.sync().await;
    assert!(device_b.read("gone.md").await.is_none());
    assert_eq!(device_b.read("stays.md").await.unwrap(), b"hi");
}

#[tokio::test]
async fn test_mass_delete_is_refused() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;

    for i in 0..12 {
        device.write(&format!("doc{i:02}.md"), b"content").await;
    }
    device.sync().await;

    // Simulate a provider-side wipe (or a broken listing).
    for i in 0..12 {
        let meta = adapter
            .get_file_metadata(&format!("doc{i:02}.md"))
            .await
            .unwrap()
            .unwrap();
        adapter.delete_file(&meta.id).await.unwrap();
    }

    let err = device
        .orchestrator
        .request_sync(vaultsync::SyncRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MassDeleteRefused { .. }));

    // Nothing was deleted locally.
    assert_eq!(device.local_paths().await.len(), 12);
}

#[tokio::test]
async fn test_encrypted_vault_roundtrip_between_devices() {
    support::tracing_init();
    let key = EncryptionEngine::generate_key_hex();
    let adapter = InMemoryAdapter::new("vault");

    let device_a = TestDevice::new(
        &adapter,
        DeviceOptions::named("device-a")
            .with_encryption(EncryptionEngine::from_hex_key(&key).unwrap()),
    )
    .await;
    let device_b = TestDevice::new(
        &adapter,
        DeviceOptions::named("device-b")
            .with_encryption(EncryptionEngine::from_hex_key(&key).unwrap()),
    )
    .await;

    device_a.write("secret.md", b"do not leak\n").await;
    device_a.sync().await;

    // The remote only ever sees ciphertext.
    let stored = adapter.file_content("secret.md").await.unwrap();
    assert_ne!(stored, b"do not leak\n");
    let needle = b"do not leak";
    assert!(!stored.windows(needle.len()).any(|w| w == needle));

    device_b.sync().await;
    assert_eq!(device_b.read("secret.md").await.unwrap(), b"do not leak\n");

    // Index carries both digests so reconciliation works hash-only.
    let entry = device_b.entry("secret.md").await.unwrap();
    assert_eq!(entry.plain_hash, hashing::content_hash(b"do not leak\n"));
    assert_ne!(entry.hash, entry.plain_hash);
}

#[tokio::test]
async fn test_migration_to_encrypted_vault() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;

    device.write("notes/a.md", b"plain one\n").await;
    device.write("b.md", b"plain two\n").await;
    device.sync().await;
    assert_eq!(
        adapter.file_content("notes/a.md").await.unwrap(),
        b"plain one\n"
    );

    let key = EncryptionEngine::generate_key_hex();
    let engine = EncryptionEngine::from_hex_key(&key).unwrap();
    vaultsync::migration::migrate_to_encrypted(
        &device.orchestrator,
        engine.clone(),
        b"wrapped-key-blob".to_vec(),
    )
    .await
    .unwrap();

    // Canonical paths now hold ciphertext that the vault key opens.
    let stored = adapter.file_content("notes/a.md").await.unwrap();
    assert_ne!(stored, b"plain one\n");
    assert_eq!(
        format::decrypt_auto(&engine, &stored).unwrap(),
        b"plain one\n"
    );

    // The vault-lock marks the vault as encrypted; the plaintext tree is
    // parked under a dated backup.
    assert!(adapter
        .file_content("data/remote/vault-lock.vault")
        .await
        .is_some());
    let listing = adapter.list_files(None).await.unwrap();
    assert!(listing
        .iter()
        .any(|r| r.path.starts_with("migration/backup-") && r.path.ends_with("notes/a.md")));

    // The engine keeps syncing, encrypted, without re-uploading everything.
    device.write("c.md", b"new after migration\n").await;
    device.sync().await;
    let stored = adapter.file_content("c.md").await.unwrap();
    assert_ne!(stored, b"new after migration\n");
    assert_eq!(
        format::decrypt_auto(&engine, &stored).unwrap(),
        b"new after migration\n"
    );
    assert_eq!(device.read("notes/a.md").await.unwrap(), b"plain one\n");
}

#[tokio::test]
async fn test_second_migration_is_refused() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;
    device.write("a.md", b"x").await;
    device.sync().await;

    let engine = EncryptionEngine::from_hex_key(&EncryptionEngine::generate_key_hex()).unwrap();
    vaultsync::migration::migrate_to_encrypted(&device.orchestrator, engine.clone(), b"k".to_vec())
        .await
        .unwrap();

    let err = vaultsync::migration::migrate_to_encrypted(
        &device.orchestrator,
        engine,
        b"k".to_vec(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SyncError::MigrationRefused(_)));
}

#[tokio::test]
async fn test_unchanged_vault_short_circuits() {
    support::tracing_init();
    let adapter = InMemoryAdapter::new("vault");
    let device = TestDevice::new(&adapter, DeviceOptions::named("device-a")).await;
    device.write("a.md", b"stable").await;
    device.sync().await;

    let revisions_before = adapter
        .list_revisions("data/remote/sync-index.json")
        .await
        .unwrap()
        .len();

    // A cycle with nothing dirty and an unmoved remote index writes nothing.
    device.sync().await;
    let revisions_after = adapter
        .list_revisions("data/remote/sync-index.json")
        .await
        .unwrap()
        .len();
    assert_eq!(revisions_before, revisions_after);
}
