// Wire formats for encrypted vault content.
//
// Single-blob format: `IV (12) ‖ ciphertext`. Used for small files.
//
// Chunked format, self-describing:
//
// ```text
// Offset  Size  Field
//    0      4   magic = "VSC2" (4 ASCII bytes)
//    4      4   plaintext_chunk_size (LE u32)
//    8      4   total_chunks         (LE u32)
//   12    ...   per chunk: IV (12) ‖ ciphertext (chunk plaintext + tag)
// ```
//
// The last chunk holds the remainder and may be shorter; it still carries a
// full GCM tag. An empty file is exactly one zero-plaintext chunk, so
// `total_chunks` is never zero in well-formed output. Format detection is by
// magic: anything whose first four bytes are not `VSC2` is a single blob.

use super::{CryptoError, EncryptionEngine, IV_SIZE, TAG_SIZE};

/// Magic prefix of the chunked format.
pub const VSC2_MAGIC: [u8; 4] = *b"VSC2";
/// Chunked-format header length in bytes.
pub const VSC2_HEADER_SIZE: usize = 12;

/// True when `data` is in the chunked format.
pub fn is_chunked(data: &[u8]) -> bool {
    data.len() >= VSC2_MAGIC.len() && data[..VSC2_MAGIC.len()] == VSC2_MAGIC
}

/// Number of chunks a plaintext of `len` bytes occupies: `max(1, ceil)`.
pub fn chunk_count(len: u64, chunk_size: u32) -> u32 {
    let count = len.div_ceil(chunk_size as u64);
    count.max(1) as u32
}

/// Exact encrypted size of a chunked blob for a given plaintext length.
pub fn chunked_size(plaintext_len: u64, chunk_size: u32) -> u64 {
    let chunks = chunk_count(plaintext_len, chunk_size) as u64;
    VSC2_HEADER_SIZE as u64 + chunks * IV_SIZE as u64 + plaintext_len + chunks * TAG_SIZE as u64
}

/// Encrypt as a single blob: `IV ‖ ciphertext`.
pub fn encrypt_single(engine: &EncryptionEngine, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    loop {
        let (iv, ciphertext) = engine.encrypt(plaintext)?;
        // A random IV that happens to begin with the chunked-format magic
        // would make the blob parse as chunked on download; draw again.
        if iv[..VSC2_MAGIC.len()] == VSC2_MAGIC {
            continue;
        }
        let mut out = Vec::with_capacity(iv.len() + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        return Ok(out);
    }
}

/// Decrypt a single blob.
pub fn decrypt_single(engine: &EncryptionEngine, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_SIZE {
        return Err(CryptoError::Format {
            reason: format!("blob of {} bytes is shorter than the IV", data.len()),
            chunk_index: None,
        });
    }
    let (iv, ciphertext) = data.split_at(IV_SIZE);
    engine.decrypt(ciphertext, iv)
}

/// Serialize the chunked-format header.
pub fn write_header(out: &mut Vec<u8>, chunk_size: u32, total_chunks: u32) {
    out.extend_from_slice(&VSC2_MAGIC);
    out.extend_from_slice(&chunk_size.to_le_bytes());
    out.extend_from_slice(&total_chunks.to_le_bytes());
}

fn parse_header(data: &[u8]) -> Result<(u32, u32), CryptoError> {
    if data.len() < VSC2_HEADER_SIZE {
        return Err(CryptoError::Format {
            reason: format!("truncated header: {} bytes", data.len()),
            chunk_index: None,
        });
    }
    if data[..4] != VSC2_MAGIC {
        return Err(CryptoError::Format {
            reason: "bad magic".to_string(),
            chunk_index: None,
        });
    }
    let chunk_size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let total_chunks = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if chunk_size == 0 {
        return Err(CryptoError::Format {
            reason: "zero chunk size".to_string(),
            chunk_index: None,
        });
    }
    if total_chunks == 0 {
        return Err(CryptoError::Format {
            reason: "zero chunk count".to_string(),
            chunk_index: None,
        });
    }
    Ok((chunk_size, total_chunks))
}

/// Encrypt as a chunked blob with the given plaintext chunk size.
pub fn encrypt_chunked(
    engine: &EncryptionEngine,
    plaintext: &[u8],
    chunk_size: u32,
) -> Result<Vec<u8>, CryptoError> {
    if chunk_size == 0 {
        return Err(CryptoError::Encryption(
            "plaintext chunk size must be nonzero".to_string(),
        ));
    }
    let total = chunk_count(plaintext.len() as u64, chunk_size);
    let mut out = Vec::with_capacity(chunked_size(plaintext.len() as u64, chunk_size) as usize);
    write_header(&mut out, chunk_size, total);

    for index in 0..total {
        let start = index as usize * chunk_size as usize;
        let end = (start + chunk_size as usize).min(plaintext.len());
        let (iv, ciphertext) = engine.encrypt(&plaintext[start..end])?;
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
    }
    Ok(out)
}

/// Incremental chunked-format decoder.
///
/// Decrypts one chunk per call so large blobs never need a second full-size
/// plaintext allocation held alongside every ciphertext chunk.
pub struct ChunkedDecoder<'a> {
    engine: &'a EncryptionEngine,
    data: &'a [u8],
    offset: usize,
    next_index: u32,
    chunk_size: u32,
    total_chunks: u32,
}

impl<'a> ChunkedDecoder<'a> {
    pub fn new(engine: &'a EncryptionEngine, data: &'a [u8]) -> Result<Self, CryptoError> {
        let (chunk_size, total_chunks) = parse_header(data)?;
        Ok(ChunkedDecoder {
            engine,
            data,
            offset: VSC2_HEADER_SIZE,
            next_index: 0,
            chunk_size,
            total_chunks,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Declared plaintext chunk size from the header.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Decrypt the next chunk, or `None` after the last one.
    pub fn next_chunk(&mut self) -> Option<Result<Vec<u8>, CryptoError>> {
        if self.next_index == self.total_chunks {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        Some(self.decode_at(index))
    }

    fn decode_at(&mut self, index: u32) -> Result<Vec<u8>, CryptoError> {
        let data: &'a [u8] = self.data;
        let remaining = &data[self.offset.min(data.len())..];
        let is_final = index + 1 == self.total_chunks;
        let full_encrypted = IV_SIZE + self.chunk_size as usize + TAG_SIZE;

        let encrypted_len = if is_final {
            // The final chunk takes everything left; it must still hold an IV
            // and a tag, and cannot exceed a full chunk.
            if remaining.len() < IV_SIZE + TAG_SIZE || remaining.len() > full_encrypted {
                return Err(CryptoError::Format {
                    reason: format!("final chunk has {} bytes", remaining.len()),
                    chunk_index: Some(index),
                });
            }
            remaining.len()
        } else {
            if remaining.len() < full_encrypted {
                return Err(CryptoError::Format {
                    reason: format!(
                        "chunk truncated: {} of {} bytes",
                        remaining.len(),
                        full_encrypted
                    ),
                    chunk_index: Some(index),
                });
            }
            full_encrypted
        };

        let (iv, ciphertext) = remaining[..encrypted_len].split_at(IV_SIZE);
        self.offset += encrypted_len;
        self.engine
            .decrypt(ciphertext, iv)
            .map_err(|e| e.at_chunk(index))
    }
}

/// Decrypt a chunked blob in full.
pub fn decrypt_chunked(engine: &EncryptionEngine, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut decoder = ChunkedDecoder::new(engine, data)?;
    let mut out = Vec::new();
    while let Some(chunk) = decoder.next_chunk() {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Decrypt either format, routed by magic detection.
pub fn decrypt_auto(engine: &EncryptionEngine, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if is_chunked(data) {
        decrypt_chunked(engine, data)
    } else {
        decrypt_single(engine, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::from_hex_key(&EncryptionEngine::generate_key_hex()).unwrap()
    }

    #[test]
    fn test_single_blob_roundtrip_and_detection() {
        let engine = engine();
        for payload in [&b""[..], b"x", b"hello world"] {
            let blob = encrypt_single(&engine, payload).unwrap();
            assert!(!is_chunked(&blob));
            assert_eq!(decrypt_single(&engine, &blob).unwrap(), payload);
        }
    }

    #[test]
    fn test_single_blob_shorter_than_iv_is_format_error() {
        let err = decrypt_single(&engine(), &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CryptoError::Format { .. }));
    }

    #[test]
    fn test_chunked_header_layout() {
        let blob = encrypt_chunked(&engine(), &[0u8; 25], 10).unwrap();
        assert_eq!(&blob[..4], b"VSC2");
        assert_eq!(u32::from_le_bytes(blob[4..8].try_into().unwrap()), 10);
        assert_eq!(u32::from_le_bytes(blob[8..12].try_into().unwrap()), 3);
        assert!(is_chunked(&blob));
    }

    #[test]
    fn test_chunked_size_formula() {
        for (len, chunk) in [(0u64, 10u32), (1, 10), (10, 10), (11, 10), (1000, 7)] {
            let data = vec![9u8; len as usize];
            let blob = encrypt_chunked(&engine(), &data, chunk).unwrap();
            assert_eq!(blob.len() as u64, chunked_size(len, chunk), "len={len}");
        }
    }

    #[test]
    fn test_empty_plaintext_is_one_chunk() {
        let engine = engine();
        let blob = encrypt_chunked(&engine, b"", 10).unwrap();
        assert_eq!(u32::from_le_bytes(blob[8..12].try_into().unwrap()), 1);
        assert_eq!(blob.len(), VSC2_HEADER_SIZE + IV_SIZE + TAG_SIZE);
        assert_eq!(decrypt_chunked(&engine, &blob).unwrap(), b"");
    }

    #[test]
    fn test_chunked_roundtrip() {
        let engine = engine();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        for chunk in [1u32, 7, 100, 4999, 5000, 9000] {
            let blob = encrypt_chunked(&engine, &data, chunk).unwrap();
            assert_eq!(decrypt_auto(&engine, &blob).unwrap(), data, "chunk={chunk}");
        }
    }

    #[test]
    fn test_tamper_reports_offending_chunk() {
        let engine = engine();
        let data = vec![3u8; 30];
        let blob = encrypt_chunked(&engine, &data, 10).unwrap();

        // Flip one bit inside the second chunk's ciphertext.
        let mut tampered = blob.clone();
        let second_chunk = VSC2_HEADER_SIZE + (IV_SIZE + 10 + TAG_SIZE) + IV_SIZE + 2;
        tampered[second_chunk] ^= 0x80;
        let err = decrypt_chunked(&engine, &tampered).unwrap_err();
        assert!(matches!(err, CryptoError::Authentication { .. }));
        assert_eq!(err.chunk_index(), Some(1));
    }

    #[test]
    fn test_truncation_reports_offending_chunk() {
        let engine = engine();
        let blob = encrypt_chunked(&engine, &vec![5u8; 30], 10).unwrap();

        // Drop the third chunk entirely.
        let keep = VSC2_HEADER_SIZE + 2 * (IV_SIZE + 10 + TAG_SIZE);
        let err = decrypt_chunked(&engine, &blob[..keep]).unwrap_err();
        match err {
            CryptoError::Format { chunk_index, .. } => assert_eq!(chunk_index, Some(2)),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_counts_rejected() {
        let engine = engine();
        let mut blob = encrypt_chunked(&engine, b"abc", 10).unwrap();
        blob[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            decrypt_chunked(&engine, &blob),
            Err(CryptoError::Format { .. })
        ));

        let mut blob2 = encrypt_chunked(&engine, b"abc", 10).unwrap();
        blob2[4..8].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            decrypt_chunked(&engine, &blob2),
            Err(CryptoError::Format { .. })
        ));
    }
}
