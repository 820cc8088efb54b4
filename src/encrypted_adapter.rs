// Content gateway between the sync engine and the remote adapter.
//
// When encryption is on, uploads are encrypted and downloads decrypted here;
// the rest of the engine only ever sees plaintext. Upload routing:
//
// - below the chunked threshold (or threshold 0): single blob, one upload
// - at/above threshold with resumable support: streaming chunked upload
// - at/above threshold without resumable support: whole chunked blob, one upload
//
// A per-cycle `file_id → plaintext` cache avoids decrypting the same content
// twice inside one sync cycle; the orchestrator clears it at cycle boundaries.

use crate::adapter::{Adapter, AdapterError, RemoteRecord, RevisionInfo};
use crate::encryption::chunker::ChunkProducer;
use crate::encryption::format::{
    self, chunked_size, VSC2_HEADER_SIZE,
};
use crate::encryption::{CryptoError, EncryptionEngine, IV_SIZE, TAG_SIZE};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Target size of one resumable flush.
const STREAM_BATCH: usize = 5 * 1024 * 1024;
/// Required alignment of every non-final resumable flush.
const STREAM_ALIGN: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum ContentStoreError {
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Resumable upload protocol violation: {0}")]
    Streaming(String),
}

/// Adapter proxy that owns the encryption boundary.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<dyn Adapter>,
    encryption: Option<EncryptionEngine>,
    /// Plaintext size at which uploads switch to the chunked format.
    /// Zero keeps every upload in the single-blob format.
    chunked_threshold: u64,
    decrypt_cache: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl ContentStore {
    /// Plaintext store: bytes pass through untouched.
    pub fn plaintext(inner: Arc<dyn Adapter>) -> Self {
        ContentStore {
            inner,
            encryption: None,
            chunked_threshold: 0,
            decrypt_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Encrypting store with the given chunked-format threshold.
    pub fn encrypted(
        inner: Arc<dyn Adapter>,
        engine: EncryptionEngine,
        chunked_threshold: u64,
    ) -> Self {
        ContentStore {
            inner,
            encryption: Some(engine),
            chunked_threshold,
            decrypt_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.inner
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Drop the per-cycle decrypt cache. Called by the orchestrator at every
    /// cycle boundary so the cache lifetime stays bounded by one cycle.
    pub async fn clear_cycle_cache(&self) {
        self.decrypt_cache.write().await.clear();
    }

    /// Download and (if needed) decrypt a file by id.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, ContentStoreError> {
        if self.encryption.is_some() {
            if let Some(cached) = self.decrypt_cache.read().await.get(file_id) {
                debug!(file_id, "decrypt cache hit");
                return Ok(cached.clone());
            }
        }

        let raw = self.inner.download_file(file_id).await?;
        let plaintext = match &self.encryption {
            Some(engine) => format::decrypt_auto(engine, &raw)?,
            None => raw,
        };

        if self.encryption.is_some() {
            self.decrypt_cache
                .write()
                .await
                .insert(file_id.to_string(), plaintext.clone());
        }
        Ok(plaintext)
    }

    /// Upload plaintext, encrypting and routing by size.
    pub async fn upload(
        &self,
        path: &str,
        plaintext: &[u8],
        mtime_ms: i64,
        existing_id: Option<&str>,
    ) -> Result<RemoteRecord, ContentStoreError> {
        let engine = match &self.encryption {
            None => {
                return Ok(self
                    .inner
                    .upload_file(path, plaintext, mtime_ms, existing_id)
                    .await?);
            }
            Some(engine) => engine,
        };

        let size = plaintext.len() as u64;
        let use_chunked = self.chunked_threshold > 0 && size >= self.chunked_threshold;

        let record = if !use_chunked {
            let blob = format::encrypt_single(engine, plaintext)?;
            self.inner
                .upload_file(path, &blob, mtime_ms, existing_id)
                .await?
        } else if self.inner.supports_resumable_uploads() {
            self.upload_streaming(engine, path, plaintext, mtime_ms, existing_id)
                .await?
        } else {
            let blob =
                format::encrypt_chunked(engine, plaintext, engine.optimal_chunk_size() as u32)?;
            self.inner
                .upload_file(path, &blob, mtime_ms, existing_id)
                .await?
        };

        self.decrypt_cache
            .write()
            .await
            .insert(record.id.clone(), plaintext.to_vec());
        Ok(record)
    }

    /// Streaming chunked upload.
    ///
    /// Keeps a staging buffer of roughly `STREAM_BATCH + one encrypted chunk`
    /// and flushes the largest 256 KiB-aligned prefix whenever the batch mark
    /// is crossed, so peak memory stays flat regardless of file size. The
    /// final flush carries everything left and completes the session.
    async fn upload_streaming(
        &self,
        engine: &EncryptionEngine,
        path: &str,
        plaintext: &[u8],
        mtime_ms: i64,
        existing_id: Option<&str>,
    ) -> Result<RemoteRecord, ContentStoreError> {
        let chunk_size = engine.optimal_chunk_size() as u32;
        let total = chunked_size(plaintext.len() as u64, chunk_size);
        let max_encrypted_chunk = IV_SIZE + chunk_size as usize + TAG_SIZE;

        let session = self
            .inner
            .initiate_resumable_session(path, total, mtime_ms, existing_id)
            .await?;

        let mut producer = ChunkProducer::new(engine.clone(), plaintext.to_vec(), chunk_size)?;
        let mut buffer = Vec::with_capacity(STREAM_BATCH + max_encrypted_chunk + 4096);
        format::write_header(&mut buffer, chunk_size, producer.total_chunks());

        let mut offset: u64 = 0;
        let mut completed: Option<RemoteRecord> = None;

        while let Some(chunk) = producer.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk.iv);
            buffer.extend_from_slice(&chunk.ciphertext);

            if chunk.is_last() {
                // Terminating flush: whatever remains, exact declared total.
                let record = self
                    .inner
                    .upload_chunk(&session, &buffer, offset, total, path, mtime_ms)
                    .await?;
                offset += buffer.len() as u64;
                buffer.clear();
                completed = record;
                break;
            }

            if buffer.len() >= STREAM_BATCH {
                let flush_len = buffer.len() - buffer.len() % STREAM_ALIGN;
                debug_assert!(flush_len > 0);
                let response = self
                    .inner
                    .upload_chunk(&session, &buffer[..flush_len], offset, total, path, mtime_ms)
                    .await?;
                if response.is_some() {
                    return Err(ContentStoreError::Streaming(
                        "record returned before the final chunk".to_string(),
                    ));
                }
                offset += flush_len as u64;
                // Shift the unaligned tail to the front of the buffer.
                buffer.copy_within(flush_len.., 0);
                buffer.truncate(buffer.len() - flush_len);
            }
        }

        if offset != total {
            return Err(ContentStoreError::Streaming(format!(
                "uploaded {offset} of {total} declared bytes"
            )));
        }
        completed.ok_or_else(|| {
            ContentStoreError::Streaming("final chunk returned no record".to_string())
        })
    }

    /// Revision listing, forwarded to the adapter.
    pub async fn list_revisions(&self, path: &str) -> Result<Vec<RevisionInfo>, ContentStoreError> {
        Ok(self.inner.list_revisions(path).await?)
    }

    /// Revision content, decrypted when encryption is on.
    pub async fn get_revision_content(
        &self,
        path: &str,
        revision_id: &str,
    ) -> Result<Vec<u8>, ContentStoreError> {
        let raw = self.inner.get_revision_content(path, revision_id).await?;
        match &self.encryption {
            Some(engine) => Ok(format::decrypt_auto(engine, &raw)?),
            None => Ok(raw),
        }
    }

    /// Expected on-the-wire size of a plaintext at the current settings.
    pub fn encrypted_size(&self, plaintext_len: u64) -> u64 {
        match &self.encryption {
            None => plaintext_len,
            Some(engine) => {
                let use_chunked =
                    self.chunked_threshold > 0 && plaintext_len >= self.chunked_threshold;
                if use_chunked {
                    chunked_size(plaintext_len, engine.optimal_chunk_size() as u32)
                } else {
                    (IV_SIZE + TAG_SIZE) as u64 + plaintext_len
                }
            }
        }
    }
}

// Header bytes count toward the first flush's alignment math, so the header
// size itself must not break alignment assumptions.
const _: () = assert!(VSC2_HEADER_SIZE < STREAM_ALIGN);
