//! Unit tests for the compress/encrypt pipeline and checksums
//!
//! The pipeline must reproduce every input byte for byte, for any size,
//! and must refuse to decrypt with the wrong key.

use backup_engine::integrity::{checksum_bytes, IntegrityVerifier};
use backup_engine::secrets::{EncryptionKey, NoKeyProvider, StaticKeyProvider};
use backup_engine::transform::encrypt::CHUNK_SIZE;
use backup_engine::transform::{StandardTransforms, TransformError, TransformPipeline};
use backup_engine::utils::cancel::CancelToken;
use proptest::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use test_utils::{pseudo_random_bytes, test_key};

fn transforms(key: EncryptionKey) -> StandardTransforms {
    StandardTransforms::new(6, Arc::new(StaticKeyProvider::new(key)))
}

/// Forward then inverse through a fresh pipeline, returning the bytes that come back
fn round_trip(data: &[u8], compress: bool, encrypt: bool, dir: &Path) -> Vec<u8> {
    let factory = transforms(test_key());
    let pipeline = TransformPipeline::for_flags(&factory, compress, encrypt).unwrap();
    let cancel = CancelToken::new();

    let input = dir.join("artifact.bin");
    fs::write(&input, data).unwrap();

    let stored = pipeline.forward(&input, dir, true, &cancel).unwrap();
    if !pipeline.is_empty() {
        assert!(!input.exists(), "forward should consume its input");
    }

    let restored = pipeline.inverse(&stored, dir, true, &cancel).unwrap();
    assert_eq!(restored, input, "inverse should recover the original file name");
    fs::read(&restored).unwrap()
}

#[rstest]
#[case::empty(0)]
#[case::one_byte(1)]
#[case::chunk_minus_one(CHUNK_SIZE - 1)]
#[case::exact_chunk(CHUNK_SIZE)]
#[case::chunk_plus_one(CHUNK_SIZE + 1)]
#[case::several_chunks(3 * CHUNK_SIZE + 17)]
fn test_round_trip_at_chunk_boundaries(#[case] len: usize) {
    let dir = tempfile::tempdir().unwrap();
    let data = pseudo_random_bytes(len, len as u64);

    let restored = round_trip(&data, true, true, dir.path());
    assert_eq!(restored.len(), data.len());
    assert_eq!(checksum_bytes(&restored), checksum_bytes(&data));
}

#[rstest]
#[case::none(false, false)]
#[case::compress_only(true, false)]
#[case::encrypt_only(false, true)]
#[case::both(true, true)]
fn test_round_trip_for_every_flag_combination(#[case] compress: bool, #[case] encrypt: bool) {
    let dir = tempfile::tempdir().unwrap();
    let data = b"id,name\n1,alpha\n2,bravo\n".repeat(500);

    let restored = round_trip(&data, compress, encrypt, dir.path());
    assert_eq!(restored, data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_compress_encrypt_round_trip(data in proptest::collection::vec(any::<u8>(), 0..200_000)) {
        let dir = tempfile::tempdir().unwrap();
        let restored = round_trip(&data, true, true, dir.path());
        prop_assert_eq!(checksum_bytes(&restored), checksum_bytes(&data));
        prop_assert_eq!(restored, data);
    }
}

#[test]
fn test_wrong_key_is_a_decryption_error() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let input = dir.path().join("dump.sql");
    fs::write(&input, b"CREATE TABLE t (id int);\n").unwrap();

    let writer = transforms(test_key());
    let stored = TransformPipeline::for_flags(&writer, true, true)
        .unwrap()
        .forward(&input, dir.path(), false, &cancel)
        .unwrap();

    let reader = transforms(EncryptionKey::from_bytes([9u8; 32]));
    let pipeline = TransformPipeline::from_names(&reader, "compress,encrypt").unwrap();
    let result = pipeline.inverse(&stored, dir.path(), false, &cancel);

    assert!(matches!(result, Err(TransformError::Decryption(_))));
    assert!(stored.exists(), "a failed inverse must not consume the stored artifact");
    assert!(!dir.path().join("dump.sql.bz2").exists(), "no partial plaintext is left behind");
}

#[test]
fn test_encryption_without_key_fails_before_running() {
    let factory = StandardTransforms::new(6, Arc::new(NoKeyProvider));

    let result = TransformPipeline::for_flags(&factory, true, true);
    assert!(matches!(result, Err(TransformError::Key(_))));

    // Compression alone needs no key
    assert!(TransformPipeline::for_flags(&factory, true, false).is_ok());
}

#[test]
fn test_recorded_names_rebuild_the_same_pipeline() {
    let factory = transforms(test_key());
    let pipeline = TransformPipeline::for_flags(&factory, true, true).unwrap();
    assert_eq!(pipeline.names(), "compress,encrypt");
    assert_eq!(pipeline.extension(), ".bz2.enc");

    let rebuilt = TransformPipeline::from_names(&factory, &pipeline.names()).unwrap();
    assert_eq!(rebuilt.names(), pipeline.names());

    let empty = TransformPipeline::from_names(&factory, "").unwrap();
    assert!(empty.is_empty());
}

#[test]
fn test_checksum_is_stable_and_content_addressed() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = IntegrityVerifier::new();
    let cancel = CancelToken::new();
    let data = pseudo_random_bytes(100_000, 42);

    let a = dir.path().join("a.bin");
    let b = dir.path().join("b.bin");
    fs::write(&a, &data).unwrap();
    fs::write(&b, &data).unwrap();

    let sum_a = verifier.checksum(&a, &cancel).unwrap();
    assert_eq!(sum_a, verifier.checksum(&a, &cancel).unwrap());
    assert_eq!(sum_a, verifier.checksum(&b, &cancel).unwrap());
    assert_eq!(sum_a, checksum_bytes(&data));
    assert!(sum_a.starts_with("sha256:"));

    let digest = verifier.digest(&a, &cancel).unwrap();
    assert_eq!(digest.size_bytes, data.len() as u64);

    let mut flipped = data.clone();
    flipped[50_000] ^= 0x01;
    fs::write(&b, &flipped).unwrap();
    assert!(!verifier.verify(&b, &sum_a, &cancel).unwrap());
}
