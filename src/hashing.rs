use md5::{Digest, Md5};
use std::path::Path;
use tokio::io::{AsyncReadExt, BufReader};

/// Read size for incremental file hashing. Kept at 1 MiB so hashing large
/// files yields to the event loop between chunks.
const HASH_READ_CHUNK: usize = 1024 * 1024;

/// MD5 digest of a buffer as lowercase hex.
///
/// The reference remote echoes MD5 for uploaded content, so the engine hashes
/// with MD5 end to end. Callers treat the result as an opaque digest string.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// MD5 digest of a file, read incrementally.
pub async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_READ_CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase a provider-reported digest. Providers return mixed-case hex;
/// every comparison in the engine goes through this first.
pub fn normalize_digest(digest: &str) -> String {
    digest.to_ascii_lowercase()
}

/// Case-insensitive digest equality.
pub fn digests_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // md5("hello")
        assert_eq!(content_hash(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_stable_across_reads() {
        let data = vec![7u8; 3 * HASH_READ_CHUNK + 17];
        assert_eq!(content_hash(&data), content_hash(&data));
    }

    #[test]
    fn test_digest_comparison_is_case_insensitive() {
        assert!(digests_equal(
            "5D41402ABC4B2A76B9719D911017C592",
            "5d41402abc4b2a76b9719d911017c592"
        ));
        assert_eq!(
            normalize_digest("ABCDEF012345"),
            "abcdef012345".to_string()
        );
    }

    #[tokio::test]
    async fn test_file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data = vec![42u8; HASH_READ_CHUNK + 123];
        tokio::fs::write(&path, &data).await.unwrap();

        let from_file = hash_file(&path).await.unwrap();
        assert_eq!(from_file, content_hash(&data));
    }
}
