// Wire-format invariants for the encryption codec.

use vaultsync::encryption::format::{
    chunk_count, chunked_size, decrypt_auto, decrypt_chunked, decrypt_single, encrypt_chunked,
    encrypt_single, is_chunked, VSC2_HEADER_SIZE,
};
use vaultsync::encryption::{CryptoError, EncryptionEngine, IV_SIZE, TAG_SIZE};

fn engine() -> EncryptionEngine {
    EncryptionEngine::from_hex_key(&EncryptionEngine::generate_key_hex()).unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_both_formats_roundtrip_across_sizes() {
    let engine = engine();
    for len in [0usize, 1, 27, 1024, 65_536, 1_048_548, 1_048_549, 2_097_152] {
        let data = payload(len);

        let single = encrypt_single(&engine, &data).unwrap();
        assert_eq!(decrypt_single(&engine, &single).unwrap(), data, "len={len}");

        let chunked = encrypt_chunked(&engine, &data, 1_048_548).unwrap();
        assert_eq!(decrypt_auto(&engine, &chunked).unwrap(), data, "len={len}");
    }
}

#[test]
fn test_encrypted_size_is_exact() {
    let engine = engine();
    for (len, chunk) in [
        (0u64, 1u32),
        (0, 1_048_548),
        (1, 1_048_548),
        (1_048_548, 1_048_548),
        (1_048_549, 1_048_548),
        (3_000_000, 1_048_548),
        (999, 100),
    ] {
        let data = payload(len as usize);
        let blob = encrypt_chunked(&engine, &data, chunk).unwrap();
        let chunks = chunk_count(len, chunk) as u64;
        assert_eq!(
            blob.len() as u64,
            VSC2_HEADER_SIZE as u64 + chunks * IV_SIZE as u64 + len + chunks * TAG_SIZE as u64,
            "len={len} chunk={chunk}"
        );
        assert_eq!(blob.len() as u64, chunked_size(len, chunk));
    }
}

#[test]
fn test_header_bytes_are_fixed() {
    let engine = engine();
    let blob = encrypt_chunked(&engine, &payload(2_500_000), 1_048_548).unwrap();
    assert_eq!(&blob[..4], &[0x56, 0x53, 0x43, 0x32]);
    assert_eq!(
        u32::from_le_bytes(blob[4..8].try_into().unwrap()),
        1_048_548
    );
    assert_eq!(u32::from_le_bytes(blob[8..12].try_into().unwrap()), 3);
}

#[test]
fn test_format_detection_never_confuses_the_two() {
    let engine = engine();
    for len in [0usize, 5, 100, 4096] {
        let data = payload(len);
        assert!(is_chunked(&encrypt_chunked(&engine, &data, 1024).unwrap()));
        // The single-blob encryptor redraws IVs that would alias the magic.
        for _ in 0..50 {
            assert!(!is_chunked(&encrypt_single(&engine, &data).unwrap()));
        }
    }
}

#[test]
fn test_bit_flips_fail_authentication_everywhere() {
    let engine = engine();
    let data = payload(300);
    let blob = encrypt_chunked(&engine, &data, 100).unwrap();

    // Sample a flip inside every chunk's ciphertext.
    let chunk_len = IV_SIZE + 100 + TAG_SIZE;
    for chunk_index in 0..3u32 {
        let offset =
            VSC2_HEADER_SIZE + chunk_index as usize * chunk_len + IV_SIZE + 40;
        let mut tampered = blob.clone();
        tampered[offset] ^= 0x01;
        let err = decrypt_chunked(&engine, &tampered).unwrap_err();
        assert!(matches!(err, CryptoError::Authentication { .. }));
        assert_eq!(err.chunk_index(), Some(chunk_index));
    }

    let single = encrypt_single(&engine, &data).unwrap();
    let mut tampered = single.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert!(matches!(
        decrypt_single(&engine, &tampered),
        Err(CryptoError::Authentication { .. })
    ));
}

#[test]
fn test_truncation_is_a_format_error_with_chunk_index() {
    let engine = engine();
    let blob = encrypt_chunked(&engine, &payload(300), 100).unwrap();
    let chunk_len = IV_SIZE + 100 + TAG_SIZE;

    // Cut in the middle of the second chunk.
    let cut = VSC2_HEADER_SIZE + chunk_len + chunk_len / 2;
    let err = decrypt_chunked(&engine, &blob[..cut]).unwrap_err();
    match err {
        CryptoError::Format { chunk_index, .. } => assert_eq!(chunk_index, Some(1)),
        other => panic!("expected format error, got {other:?}"),
    }

    // A bare header with a declared chunk that never arrives.
    let err = decrypt_chunked(&engine, &blob[..VSC2_HEADER_SIZE]).unwrap_err();
    assert!(matches!(err, CryptoError::Format { .. }));
}

#[test]
fn test_wrong_key_fails_closed() {
    let sender = engine();
    let receiver = engine();
    let blob = encrypt_chunked(&sender, &payload(500), 100).unwrap();
    assert!(matches!(
        decrypt_auto(&receiver, &blob),
        Err(CryptoError::Authentication { .. })
    ));
}
