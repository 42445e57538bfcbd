use std::fs;

use anyhow::Result;
use sha2::{Digest, Sha256, Sha512};
use tempfile::TempDir;

use super::*;

fn new_store(algorithms: &[HashAlgorithm]) -> Result<(TempDir, BlobStore)> {
    let temp = tempfile::tempdir()?;
    let store = BlobStore::open(temp.path().join("blos"), algorithms)?;
    Ok((temp, store))
}

fn write_source(dir: &TempDir, name: &str, contents: &[u8]) -> Result<PathBuf> {
    let path = dir.path().join(name);
    fs::write(&path, contents)?;
    Ok(path)
}

#[test]
fn creates_layout_and_index() -> Result<()> {
    let (_temp, store) = new_store(&[])?;
    for dir in [OBJECTS_DIR, LOCKS_DIR, TMP_DIR] {
        assert!(store.root().join(dir).is_dir(), "{dir} should exist");
    }
    assert!(store.root().join(INDEX_FILENAME).is_file());
    assert_eq!(store.algorithms(), &[HashAlgorithm::Sha512]);
    Ok(())
}

#[test]
fn insert_is_idempotent_and_addressed_by_sha512() -> Result<()> {
    let (temp, store) = new_store(&[HashAlgorithm::Sha256])?;
    let source = write_source(&temp, "payload.txt", b"payload")?;

    let first = store.insert_blob(&source)?;
    let second = store.insert_blob(&source)?;

    let expected = hex::encode(Sha512::digest(b"payload"));
    assert_eq!(first.sha512(), expected);
    assert_eq!(
        first.digest(HashAlgorithm::Sha256),
        Some(hex::encode(Sha256::digest(b"payload")).as_str())
    );
    assert_eq!(first.path, second.path);
    assert_eq!(first.created_at, second.created_at);
    assert!(first.path.ends_with(
        std::path::Path::new(&expected[0..2])
            .join(&expected[2..4])
            .join(&expected)
    ));
    assert_eq!(first.read_bytes()?, b"payload");
    assert_eq!(store.list()?, vec![expected]);
    Ok(())
}

#[test]
fn read_by_sha256_finds_same_blob() -> Result<()> {
    let (temp, store) = new_store(&[HashAlgorithm::Sha256])?;
    let source = write_source(&temp, "a.bin", b"abc")?;
    let blob = store.insert_blob(&source)?;

    let found = store
        .read(&BlobQuery::sha256(hex::encode(Sha256::digest(b"abc"))))?
        .expect("blob by sha256");
    assert_eq!(found, blob);
    Ok(())
}

#[test]
fn read_prunes_rows_whose_object_vanished() -> Result<()> {
    let (temp, store) = new_store(&[])?;
    let source = write_source(&temp, "gone.bin", b"soon gone")?;
    let blob = store.insert_blob(&source)?;
    fs::remove_file(&blob.path)?;

    assert!(store.read(&BlobQuery::sha512(blob.sha512()))?.is_none());
    assert!(store.list()?.is_empty(), "stale row should be pruned");
    Ok(())
}

#[test]
fn insert_hashed_fills_missing_algorithms() -> Result<()> {
    let (temp, store) = new_store(&[HashAlgorithm::Sha256])?;
    let source = write_source(&temp, "pre.bin", b"precomputed")?;
    let mut hashes = Hashes::new();
    hashes.insert(
        HashAlgorithm::Sha512,
        hex::encode(Sha512::digest(b"precomputed")),
    );

    let blob = store.insert_hashed(&source, &hashes)?;
    assert_eq!(
        blob.digest(HashAlgorithm::Sha256),
        Some(hex::encode(Sha256::digest(b"precomputed")).as_str())
    );
    Ok(())
}

#[test]
fn rejects_malformed_digests() -> Result<()> {
    let (temp, store) = new_store(&[])?;
    let err = store
        .read(&BlobQuery::sha512("../../etc/passwd"))
        .expect_err("invalid digest");
    assert_eq!(err.code(), "FP801");

    let source = write_source(&temp, "x.bin", b"x")?;
    let mut hashes = Hashes::new();
    hashes.insert(HashAlgorithm::Sha512, "not-hex".to_string());
    let err = store.insert_hashed(&source, &hashes).expect_err("bad hashes");
    assert!(matches!(err, StoreError::InvalidDigest { .. }));
    Ok(())
}

#[test]
fn verify_detects_corruption() -> Result<()> {
    let (temp, store) = new_store(&[])?;
    let source = write_source(&temp, "v.bin", b"original")?;
    let blob = store.insert_blob(&source)?;
    assert_eq!(store.verify(blob.sha512())?, blob);

    fs::write(&blob.path, b"tampered")?;
    let err = store.verify(blob.sha512()).expect_err("corrupt blob");
    assert!(matches!(err, StoreError::DigestMismatch { .. }));
    assert_eq!(err.code(), "FP800");
    Ok(())
}

#[test]
fn reinserting_repairs_truncated_object() -> Result<()> {
    let (temp, store) = new_store(&[])?;
    let source = write_source(&temp, "r.bin", b"repair me please")?;
    let blob = store.insert_blob(&source)?;
    fs::write(&blob.path, b"short")?;

    let repaired = store.insert_blob(&source)?;
    assert_eq!(repaired.read_bytes()?, b"repair me please");
    store.verify(repaired.sha512())?;
    Ok(())
}

#[test]
fn delete_and_usage() -> Result<()> {
    let (temp, store) = new_store(&[])?;
    let a = store.insert_blob(&write_source(&temp, "a", b"aaaa")?)?;
    store.insert_blob(&write_source(&temp, "b", b"bb")?)?;
    assert_eq!(
        store.usage()?,
        StoreUsage {
            blobs: 2,
            total_bytes: 6
        }
    );

    assert!(store.delete(a.sha512())?);
    assert!(!store.delete(a.sha512())?);
    assert!(!a.path.exists());
    assert_eq!(store.usage()?.blobs, 1);
    let err = store.verify(a.sha512()).expect_err("deleted");
    assert!(matches!(err, StoreError::MissingBlob { .. }));
    Ok(())
}

#[test]
fn rejects_incompatible_format_version() -> Result<()> {
    let (_temp, store) = new_store(&[])?;
    let conn = rusqlite::Connection::open(store.root().join(INDEX_FILENAME))?;
    conn.execute(
        "UPDATE meta SET value = '999' WHERE key = ?1",
        [META_KEY_FORMAT_VERSION],
    )?;
    drop(conn);

    let err = BlobStore::open(store.root(), &[]).expect_err("format mismatch");
    assert_eq!(err.code(), "FP812");
    Ok(())
}
