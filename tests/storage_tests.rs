//! Tests for blob storage module.
//!
//! Validates content-addressed storage, digest verification, digest
//! sanitization, concurrent writers and garbage collection.

use hubpack::BlobStore;
use hubpack::storage::sha256_digest;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn new_store(temp: &TempDir) -> BlobStore {
    BlobStore::under_root(temp.path()).unwrap()
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn test_store_lives_under_root() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    assert_eq!(store.base_dir(), temp.path().join("blobs"));
    assert!(store.base_dir().is_dir());
}

// =============================================================================
// Put / Get
// =============================================================================

#[test]
fn test_put_blob_verifies_and_stores() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let data = b"streamlit==1.38.0\n";
    let digest = digest_of(data);
    assert!(!store.has_blob(&digest));

    store.put_blob(&digest, data).unwrap();

    assert!(store.has_blob(&digest));
    assert_eq!(store.get_blob(&digest).unwrap(), data);
}

#[test]
fn test_put_bytes_matches_sha256_digest() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let data = b"layer bytes";
    let digest = store.put_bytes(data).unwrap();

    assert_eq!(digest, digest_of(data));
    assert_eq!(digest, sha256_digest(data));
}

#[test]
fn test_identical_content_stored_once() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let first = store.put_bytes(b"same").unwrap();
    let second = store.put_bytes(b"same").unwrap();

    assert_eq!(first, second);
    assert_eq!(store.list_blobs().unwrap().len(), 1);
}

#[test]
fn test_get_missing_blob_is_blob_not_found() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let err = store
        .get_blob("sha256:0000000000000000000000000000000000000000000000000000000000000000")
        .unwrap_err();
    assert!(matches!(err, hubpack::Error::BlobNotFound { .. }));
}

// =============================================================================
// Digest Verification
// =============================================================================

#[test]
fn test_digest_mismatch_rejected() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let wrong = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
    let err = store.put_blob(wrong, b"actual content").unwrap_err();

    assert!(err.to_string().contains("digest mismatch"));
    assert!(!store.has_blob(wrong));
}

#[test]
fn test_non_sha256_algorithms_rejected() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    for digest in [
        "sha512:00000000000000000000000000000000",
        "md5:d41d8cd98f00b204e9800998ecf8427e",
    ] {
        let err = store.put_blob(digest, b"x").unwrap_err();
        assert!(
            err.to_string().contains("unsupported digest algorithm"),
            "{} should be rejected",
            digest
        );
    }
}

// =============================================================================
// Path Sanitization
// =============================================================================

#[test]
fn test_traversal_in_digest_stays_inside_store() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let path = store.blob_path("sha256:../../../etc/passwd");

    assert!(path.starts_with(store.base_dir()));
    assert!(!path.to_string_lossy().contains(".."));
}

#[test]
fn test_blob_path_is_sharded_by_prefix() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let digest = "sha256:abcd1234567890abcd1234567890abcd1234567890abcd1234567890abcd1234";
    let path = store.blob_path(digest);

    assert_eq!(
        path,
        store
            .base_dir()
            .join("sha256")
            .join("ab")
            .join("abcd1234567890abcd1234567890abcd1234567890abcd1234567890abcd1234")
    );
}

// =============================================================================
// Concurrent Writers
// =============================================================================

#[test]
fn test_concurrent_writers_of_one_digest() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(new_store(&temp));
    let data = b"shared dependency layer".to_vec();
    let digest = digest_of(&data);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let digest = digest.clone();
            let data = data.clone();
            thread::spawn(move || store.put_blob(&digest, &data))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(store.get_blob(&digest).unwrap(), data);
    assert_eq!(store.list_blobs().unwrap(), vec![digest]);
}

// =============================================================================
// Garbage Collection
// =============================================================================

#[test]
fn test_gc_removes_only_unreferenced() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    let keep = store.put_bytes(b"keep this").unwrap();
    let drop = store.put_bytes(b"remove this").unwrap();

    let referenced: HashSet<String> = [keep.clone()].into_iter().collect();
    let stats = store.gc(&referenced).unwrap();

    assert!(store.has_blob(&keep));
    assert!(!store.has_blob(&drop));
    assert_eq!(stats.removed_count, 1);
    assert_eq!(stats.freed_bytes, b"remove this".len() as u64);
}

#[test]
fn test_total_size_sums_blobs() {
    let temp = TempDir::new().unwrap();
    let store = new_store(&temp);

    store.put_bytes(&[1u8; 100]).unwrap();
    store.put_bytes(&[2u8; 50]).unwrap();

    assert_eq!(store.total_size().unwrap(), 150);
}
