// Lazy producer of encrypted chunks for the streaming upload path.
//
// Pulls one plaintext slice at a time and encrypts it on the blocking pool,
// so the event loop never stalls on GCM for a megabyte chunk and at most one
// encrypted chunk is in flight beyond the caller's staging buffer.

use super::format::chunk_count;
use super::{CryptoError, EncryptionEngine};

/// One encrypted chunk of a chunked-format stream, in production order.
#[derive(Debug, Clone)]
pub struct EncryptedChunk {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub index: u32,
    pub total: u32,
}

impl EncryptedChunk {
    /// Wire length of this chunk (`IV ‖ ciphertext`).
    pub fn encoded_len(&self) -> usize {
        self.iv.len() + self.ciphertext.len()
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

/// Sequential chunk producer over a buffered plaintext snapshot.
pub struct ChunkProducer {
    engine: EncryptionEngine,
    plaintext: Vec<u8>,
    chunk_size: u32,
    total: u32,
    next_index: u32,
}

impl ChunkProducer {
    pub fn new(
        engine: EncryptionEngine,
        plaintext: Vec<u8>,
        chunk_size: u32,
    ) -> Result<Self, CryptoError> {
        if chunk_size == 0 {
            return Err(CryptoError::Encryption(
                "plaintext chunk size must be nonzero".to_string(),
            ));
        }
        let total = chunk_count(plaintext.len() as u64, chunk_size);
        Ok(ChunkProducer {
            engine,
            plaintext,
            chunk_size,
            total,
            next_index: 0,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.total
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Produce the next chunk, or `None` after the last one.
    pub async fn next(&mut self) -> Option<Result<EncryptedChunk, CryptoError>> {
        if self.next_index == self.total {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;

        let start = index as usize * self.chunk_size as usize;
        let end = (start + self.chunk_size as usize).min(self.plaintext.len());
        let slice = self.plaintext[start..end].to_vec();
        let engine = self.engine.clone();
        let total = self.total;

        let result = tokio::task::spawn_blocking(move || {
            let (iv, ciphertext) = engine.encrypt(&slice)?;
            Ok(EncryptedChunk {
                iv,
                ciphertext,
                index,
                total,
            })
        })
        .await
        .map_err(|e| CryptoError::Encryption(format!("encrypt task panicked: {e}")));

        Some(match result {
            Ok(inner) => inner,
            Err(e) => Err(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::format::{chunked_size, write_header};
    use crate::encryption::format::decrypt_chunked;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::from_hex_key(&EncryptionEngine::generate_key_hex()).unwrap()
    }

    #[tokio::test]
    async fn test_produces_declared_chunk_count() {
        let engine = engine();
        let mut producer = ChunkProducer::new(engine, vec![1u8; 25], 10).unwrap();
        assert_eq!(producer.total_chunks(), 3);

        let mut seen = 0;
        while let Some(chunk) = producer.next().await {
            let chunk = chunk.unwrap();
            assert_eq!(chunk.index, seen);
            assert_eq!(chunk.total, 3);
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_empty_input_yields_single_chunk() {
        let mut producer = ChunkProducer::new(engine(), Vec::new(), 10).unwrap();
        assert_eq!(producer.total_chunks(), 1);
        let only = producer.next().await.unwrap().unwrap();
        assert!(only.is_last());
        assert!(producer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_assembled_stream_matches_whole_blob_format() {
        let engine = engine();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 7) as u8).collect();

        let mut producer = ChunkProducer::new(engine.clone(), data.clone(), 1000).unwrap();
        let mut assembled = Vec::new();
        write_header(&mut assembled, 1000, producer.total_chunks());
        while let Some(chunk) = producer.next().await {
            let chunk = chunk.unwrap();
            assembled.extend_from_slice(&chunk.iv);
            assembled.extend_from_slice(&chunk.ciphertext);
        }

        assert_eq!(assembled.len() as u64, chunked_size(2500, 1000));
        assert_eq!(decrypt_chunked(&engine, &assembled).unwrap(), data);
    }
}
