// In-memory adapter: the reference `Adapter` implementation.
//
// Backs the integration tests (two "devices" share one instance to model a
// shared remote) and documents the contract concrete adapters must meet:
// stable ids across uploads, revision capture on overwrite, a sequence-number
// change feed, and 256 KiB-aligned resumable sessions.

use crate::adapter::{
    Adapter, AdapterError, ChangeSet, RemoteChange, RemoteKind, RemoteRecord, RevisionInfo,
};
use crate::hashing;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Required alignment for non-final resumable chunks.
pub const RESUMABLE_CHUNK_ALIGN: u64 = 256 * 1024;

const REVISION_CAP: usize = 10;

#[derive(Debug, Clone)]
struct StoredRevision {
    id: String,
    mtime_ms: i64,
    data: Vec<u8>,
    keep_forever: bool,
}

#[derive(Debug, Clone)]
struct StoredFile {
    id: String,
    mtime_ms: i64,
    data: Vec<u8>,
    revisions: Vec<StoredRevision>,
}

#[derive(Debug)]
struct UploadSession {
    path: String,
    total: u64,
    mtime_ms: i64,
    existing_id: Option<String>,
    buffer: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, StoredFile>,
    folders: HashMap<String, String>,
    sessions: HashMap<String, UploadSession>,
    changes: Vec<(u64, RemoteChange)>,
    next_id: u64,
    next_seq: u64,
}

/// Shared in-memory remote store.
///
/// Clones share state, so handing clones to two sync contexts models two
/// devices against one remote.
#[derive(Clone)]
pub struct InMemoryAdapter {
    vault_name: String,
    state: Arc<Mutex<MemoryState>>,
    supports_history: bool,
    supports_resumable: bool,
    /// Providers report hex digests in inconsistent case; mimic that here so
    /// normalization stays exercised.
    uppercase_hashes: bool,
    fail_network: Arc<AtomicU32>,
}

impl InMemoryAdapter {
    pub fn new(vault_name: &str) -> Self {
        InMemoryAdapter {
            vault_name: vault_name.to_string(),
            state: Arc::new(Mutex::new(MemoryState::default())),
            supports_history: true,
            supports_resumable: true,
            uppercase_hashes: false,
            fail_network: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn without_history(mut self) -> Self {
        self.supports_history = false;
        self
    }

    pub fn without_resumable_uploads(mut self) -> Self {
        self.supports_resumable = false;
        self
    }

    pub fn with_uppercase_hashes(mut self) -> Self {
        self.uppercase_hashes = true;
        self
    }

    /// Make the next `n` transfer calls fail with a transient network error.
    pub fn fail_network_times(&self, n: u32) {
        self.fail_network.store(n, Ordering::SeqCst);
    }

    /// Raw content of a stored file, for assertions.
    pub async fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state.files.get(path).map(|f| f.data.clone())
    }

    pub async fn file_count(&self) -> usize {
        self.state.lock().await.files.len()
    }

    fn take_network_fault(&self) -> Result<(), AdapterError> {
        let remaining = self.fail_network.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_network.store(remaining - 1, Ordering::SeqCst);
            return Err(AdapterError::Network("injected fault".to_string()));
        }
        Ok(())
    }

    fn digest_of(&self, data: &[u8]) -> String {
        let digest = hashing::content_hash(data);
        if self.uppercase_hashes {
            digest.to_ascii_uppercase()
        } else {
            digest
        }
    }

    fn record_for(&self, path: &str, file: &StoredFile) -> RemoteRecord {
        RemoteRecord {
            id: file.id.clone(),
            path: path.to_string(),
            kind: RemoteKind::File,
            mtime_ms: file.mtime_ms,
            size: file.data.len() as u64,
            hash: Some(self.digest_of(&file.data)),
        }
    }

    fn store_upload(
        &self,
        state: &mut MemoryState,
        path: &str,
        data: Vec<u8>,
        mtime_ms: i64,
    ) -> RemoteRecord {
        let seq = {
            state.next_seq += 1;
            state.next_seq
        };

        let file = match state.files.get_mut(path) {
            Some(existing) => {
                // Overwrite captures the prior content as a revision.
                let rev_id = format!("{}-r{}", existing.id, existing.revisions.len() + 1);
                existing.revisions.push(StoredRevision {
                    id: rev_id,
                    mtime_ms: existing.mtime_ms,
                    data: std::mem::take(&mut existing.data),
                    keep_forever: false,
                });
                while existing.revisions.len() > REVISION_CAP {
                    match existing.revisions.iter().position(|r| !r.keep_forever) {
                        Some(oldest) => {
                            existing.revisions.remove(oldest);
                        }
                        None => break,
                    }
                }
                existing.data = data;
                existing.mtime_ms = mtime_ms;
                existing.clone()
            }
            None => {
                state.next_id += 1;
                let file = StoredFile {
                    id: format!("f{}", state.next_id),
                    mtime_ms,
                    data,
                    revisions: Vec::new(),
                };
                state.files.insert(path.to_string(), file.clone());
                file
            }
        };

        let record = self.record_for(path, &file);
        state.changes.push((
            seq,
            RemoteChange {
                file_id: record.id.clone(),
                path: Some(path.to_string()),
                removed: false,
                record: Some(record.clone()),
            },
        ));
        record
    }

    fn find_path_by_id(state: &MemoryState, id: &str) -> Option<String> {
        state
            .files
            .iter()
            .find(|(_, f)| f.id == id)
            .map(|(p, _)| p.clone())
    }
}

#[async_trait::async_trait]
impl Adapter for InMemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    fn vault_name(&self) -> &str {
        &self.vault_name
    }

    fn supports_changes_api(&self) -> bool {
        true
    }

    fn supports_hash(&self) -> bool {
        true
    }

    fn supports_history(&self) -> bool {
        self.supports_history
    }

    fn supports_resumable_uploads(&self) -> bool {
        self.supports_resumable
    }

    async fn list_files(&self, folder: Option<&str>) -> Result<Vec<RemoteRecord>, AdapterError> {
        let state = self.state.lock().await;
        let prefix = folder.map(|f| format!("{}/", f.trim_end_matches('/')));
        let mut records: Vec<RemoteRecord> = state
            .files
            .iter()
            .filter(|(path, _)| match &prefix {
                Some(p) => path.starts_with(p.as_str()),
                None => true,
            })
            .map(|(path, file)| self.record_for(path, file))
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    async fn get_file_metadata(&self, path: &str) -> Result<Option<RemoteRecord>, AdapterError> {
        let state = self.state.lock().await;
        Ok(state.files.get(path).map(|f| self.record_for(path, f)))
    }

    async fn get_file_metadata_by_id(
        &self,
        id: &str,
        known_path: Option<&str>,
    ) -> Result<Option<RemoteRecord>, AdapterError> {
        let state = self.state.lock().await;
        if let Some(path) = known_path {
            if let Some(file) = state.files.get(path) {
                if file.id == id {
                    return Ok(Some(self.record_for(path, file)));
                }
            }
        }
        Ok(Self::find_path_by_id(&state, id)
            .and_then(|path| state.files.get(&path).map(|f| self.record_for(&path, f))))
    }

    async fn download_file(&self, id: &str) -> Result<Vec<u8>, AdapterError> {
        self.take_network_fault()?;
        let state = self.state.lock().await;
        let path = Self::find_path_by_id(&state, id)
            .ok_or_else(|| AdapterError::NotFound(id.to_string()))?;
        Ok(state.files[&path].data.clone())
    }

    async fn upload_file(
        &self,
        path: &str,
        data: &[u8],
        mtime_ms: i64,
        _existing_id: Option<&str>,
    ) -> Result<RemoteRecord, AdapterError> {
        self.take_network_fault()?;
        let mut state = self.state.lock().await;
        Ok(self.store_upload(&mut state, path, data.to_vec(), mtime_ms))
    }

    async fn initiate_resumable_session(
        &self,
        path: &str,
        total: u64,
        mtime_ms: i64,
        existing_id: Option<&str>,
    ) -> Result<String, AdapterError> {
        if !self.supports_resumable {
            return Err(AdapterError::Unsupported {
                operation: "initiate_resumable_session",
            });
        }
        let mut state = self.state.lock().await;
        let uri = format!("mem-session-{}", uuid::Uuid::new_v4());
        state.sessions.insert(
            uri.clone(),
            UploadSession {
                path: path.to_string(),
                total,
                mtime_ms,
                existing_id: existing_id.map(|s| s.to_string()),
                buffer: Vec::with_capacity(total as usize),
            },
        );
        Ok(uri)
    }

    async fn upload_chunk(
        &self,
        session: &str,
        data: &[u8],
        offset: u64,
        total: u64,
        path: &str,
        mtime_ms: i64,
    ) -> Result<Option<RemoteRecord>, AdapterError> {
        self.take_network_fault()?;
        let mut state = self.state.lock().await;
        let sess = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| AdapterError::Protocol(format!("unknown session {session}")))?;

        if sess.total != total || sess.path != path {
            return Err(AdapterError::Protocol(
                "session does not match declared upload".to_string(),
            ));
        }
        if offset != sess.buffer.len() as u64 {
            return Err(AdapterError::Protocol(format!(
                "offset {} does not match received bytes {}",
                offset,
                sess.buffer.len()
            )));
        }
        let is_final = offset + data.len() as u64 == total;
        if !is_final && data.len() as u64 % RESUMABLE_CHUNK_ALIGN != 0 {
            return Err(AdapterError::Protocol(format!(
                "non-final chunk of {} bytes is not 256 KiB-aligned",
                data.len()
            )));
        }

        sess.buffer.extend_from_slice(data);
        if !is_final {
            return Ok(None);
        }

        let sess = state.sessions.remove(session).unwrap();
        let _ = sess.existing_id;
        let record = self.store_upload(&mut state, &sess.path, sess.buffer, mtime_ms);
        Ok(Some(record))
    }

    async fn delete_file(&self, id: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        let path = Self::find_path_by_id(&state, id)
            .ok_or_else(|| AdapterError::NotFound(id.to_string()))?;
        state.files.remove(&path);
        let seq = {
            state.next_seq += 1;
            state.next_seq
        };
        state.changes.push((
            seq,
            RemoteChange {
                file_id: id.to_string(),
                path: Some(path),
                removed: true,
                record: None,
            },
        ));
        Ok(())
    }

    async fn move_file(
        &self,
        id: &str,
        new_name: &str,
        new_parent: Option<&str>,
    ) -> Result<RemoteRecord, AdapterError> {
        let mut state = self.state.lock().await;

        // Folder rename: rewrite every path under the old prefix.
        if let Some(old_path) = state
            .folders
            .iter()
            .find(|(_, fid)| fid.as_str() == id)
            .map(|(p, _)| p.clone())
        {
            let new_path = match new_parent {
                Some(parent) => format!("{}/{}", parent.trim_end_matches('/'), new_name),
                None => new_name.to_string(),
            };
            let old_prefix = format!("{}/", old_path);
            let moved: Vec<(String, StoredFile)> = state
                .files
                .iter()
                .filter(|(p, _)| p.starts_with(&old_prefix))
                .map(|(p, f)| (p.clone(), f.clone()))
                .collect();
            for (old, file) in moved {
                let renamed = format!("{}/{}", new_path, &old[old_prefix.len()..]);
                state.files.remove(&old);
                state.files.insert(renamed, file);
            }
            state.folders.remove(&old_path);
            state.folders.insert(new_path.clone(), id.to_string());
            return Ok(RemoteRecord {
                id: id.to_string(),
                path: new_path,
                kind: RemoteKind::Folder,
                mtime_ms: 0,
                size: 0,
                hash: None,
            });
        }

        let old_path = Self::find_path_by_id(&state, id)
            .ok_or_else(|| AdapterError::NotFound(id.to_string()))?;
        let parent = match new_parent {
            Some(p) => p.to_string(),
            None => match old_path.rfind('/') {
                Some(i) => old_path[..i].to_string(),
                None => String::new(),
            },
        };
        let new_path = if parent.is_empty() {
            new_name.to_string()
        } else {
            format!("{}/{}", parent, new_name)
        };
        let file = state.files.remove(&old_path).unwrap();
        let record = self.record_for(&new_path, &file);
        state.files.insert(new_path, file);
        Ok(record)
    }

    async fn create_folder(&self, path: &str) -> Result<String, AdapterError> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.folders.get(path) {
            return Ok(id.clone());
        }
        state.next_id += 1;
        let id = format!("d{}", state.next_id);
        state.folders.insert(path.to_string(), id.clone());
        Ok(id)
    }

    async fn ensure_folders_exist(&self, paths: &[String]) -> Result<(), AdapterError> {
        for path in paths {
            self.create_folder(path).await?;
        }
        Ok(())
    }

    async fn get_start_page_token(&self) -> Result<String, AdapterError> {
        let state = self.state.lock().await;
        Ok(state.next_seq.to_string())
    }

    async fn get_changes(&self, token: &str) -> Result<ChangeSet, AdapterError> {
        let state = self.state.lock().await;
        let since: u64 = token
            .parse()
            .map_err(|_| AdapterError::Protocol(format!("bad change token {token}")))?;
        let changes = state
            .changes
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, c)| c.clone())
            .collect();
        Ok(ChangeSet {
            new_token: state.next_seq.to_string(),
            changes,
        })
    }

    async fn list_revisions(&self, path: &str) -> Result<Vec<RevisionInfo>, AdapterError> {
        if !self.supports_history {
            return Err(AdapterError::Unsupported {
                operation: "list_revisions",
            });
        }
        let state = self.state.lock().await;
        let file = state
            .files
            .get(path)
            .ok_or_else(|| AdapterError::NotFound(path.to_string()))?;
        let mut revisions: Vec<RevisionInfo> = file
            .revisions
            .iter()
            .map(|r| RevisionInfo {
                id: r.id.clone(),
                mtime_ms: r.mtime_ms,
                size: r.data.len() as u64,
                hash: Some(self.digest_of(&r.data)),
                keep_forever: r.keep_forever,
            })
            .collect();
        revisions.reverse();
        Ok(revisions)
    }

    async fn get_revision_content(
        &self,
        path: &str,
        revision_id: &str,
    ) -> Result<Vec<u8>, AdapterError> {
        if !self.supports_history {
            return Err(AdapterError::Unsupported {
                operation: "get_revision_content",
            });
        }
        let state = self.state.lock().await;
        let file = state
            .files
            .get(path)
            .ok_or_else(|| AdapterError::NotFound(path.to_string()))?;
        file.revisions
            .iter()
            .find(|r| r.id == revision_id)
            .map(|r| r.data.clone())
            .ok_or_else(|| AdapterError::NotFound(format!("{path}@{revision_id}")))
    }

    async fn set_revision_keep_forever(
        &self,
        path: &str,
        revision_id: &str,
        keep: bool,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| AdapterError::NotFound(path.to_string()))?;
        let rev = file
            .revisions
            .iter_mut()
            .find(|r| r.id == revision_id)
            .ok_or_else(|| AdapterError::NotFound(format!("{path}@{revision_id}")))?;
        rev.keep_forever = keep;
        Ok(())
    }

    async fn delete_revision(&self, path: &str, revision_id: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| AdapterError::NotFound(path.to_string()))?;
        file.revisions.retain(|r| r.id != revision_id);
        Ok(())
    }

    async fn reset(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        state.sessions.clear();
        Ok(())
    }
}
