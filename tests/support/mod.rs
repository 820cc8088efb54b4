// Shared fixtures for the end-to-end sync tests.
//
// A `TestDevice` is one full engine instance (vault dir, data dir, indices,
// queue) pointed at a shared in-memory remote. Two devices built over the
// same adapter model two machines syncing one vault.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vaultsync::adapter::memory::InMemoryAdapter;
use vaultsync::index::IndexEntry;
use vaultsync::sync::{EngineEvents, SyncOrchestrator, SyncRequest};
use vaultsync::{EncryptionEngine, SyncConfig};

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true)
        .try_init();
}

pub struct TestDevice {
    pub orchestrator: SyncOrchestrator,
    pub events: EngineEvents,
    pub adapter: InMemoryAdapter,
    _vault_dir: tempfile::TempDir,
    _data_dir: tempfile::TempDir,
    vault_root: PathBuf,
}

pub struct DeviceOptions {
    pub name: &'static str,
    pub large_file_threshold: u64,
    pub encryption: Option<EncryptionEngine>,
}

impl DeviceOptions {
    pub fn named(name: &'static str) -> Self {
        DeviceOptions {
            name,
            large_file_threshold: 1024 * 1024,
            encryption: None,
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.large_file_threshold = threshold;
        self
    }

    pub fn with_encryption(mut self, engine: EncryptionEngine) -> Self {
        self.encryption = Some(engine);
        self
    }
}

impl TestDevice {
    pub async fn new(adapter: &InMemoryAdapter, options: DeviceOptions) -> Self {
        let vault_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            device_id: options.name.to_string(),
            data_root: data_dir.path().to_path_buf(),
            large_file_threshold: options.large_file_threshold,
            chunked_format_threshold: 4 * 1024,
            ..SyncConfig::default()
        };
        let vault_root = vault_dir.path().to_path_buf();
        let (orchestrator, events) = SyncOrchestrator::new(
            config,
            vault_root.clone(),
            Arc::new(adapter.clone()),
            options.encryption,
        )
        .await
        .unwrap();

        TestDevice {
            orchestrator,
            events,
            adapter: adapter.clone(),
            _vault_dir: vault_dir,
            _data_dir: data_dir,
            vault_root,
        }
    }

    pub async fn write(&self, rel: &str, content: &[u8]) {
        let path = self.vault_root.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, content).await.unwrap();
    }

    pub async fn read(&self, rel: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.vault_root.join(rel)).await.ok()
    }

    pub async fn local_paths(&self) -> Vec<String> {
        self.orchestrator
            .context()
            .vault
            .scan()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect()
    }

    pub async fn sync(&self) {
        self.orchestrator
            .request_sync(SyncRequest::default())
            .await
            .unwrap();
    }

    pub async fn entry(&self, path: &str) -> Option<IndexEntry> {
        self.orchestrator
            .context()
            .local_index
            .lock()
            .await
            .get(path)
            .cloned()
    }

    pub async fn drain_queue(&self) {
        let queue = &self.orchestrator.context().queue;
        for _ in 0..300 {
            if !queue.has_pending().await {
                // One extra tick lets the worker finish bookkeeping.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("transfer queue did not drain");
    }
}
