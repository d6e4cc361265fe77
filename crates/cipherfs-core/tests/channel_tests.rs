//! End-to-end tests for cleartext channels over the ciphertext format.
//!
//! Focus areas:
//! - Content written through a channel reads back, in-session and after reopen
//! - Ciphertext layout on disk (header + fixed-size chunks)
//! - Sparse writes, truncation and the cache capacity bound
//! - Failed write-backs surface at flush or close, not at eviction

use std::path::Path;
use std::sync::Arc;

use cipherfs_core::crypto::{
    CIPHERTEXT_CHUNK_SIZE, CLEARTEXT_CHUNK_SIZE, Cryptor, HEADER_SIZE,
};
use cipherfs_core::error::CryptoFileError;
use cipherfs_core::fs::{MAX_CACHED_CHUNKS, OpenCryptoFiles, OpenOptions};
use tempfile::TempDir;

const TEST_KEY: [u8; 32] = [0x5Au8; 32];

fn test_registry() -> Arc<OpenCryptoFiles> {
    OpenCryptoFiles::new(Arc::new(Cryptor::new(TEST_KEY)))
}

fn rw() -> OpenOptions {
    OpenOptions::new().read(true).write(true).create(true)
}

/// Deterministic pseudo-random content.
fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect()
}

fn read_all(files: &Arc<OpenCryptoFiles>, path: &Path, len: usize) -> Vec<u8> {
    let channel = files
        .open(path, OpenOptions::new().read(true))
        .expect("Failed to open for reading");
    let mut buf = vec![0u8; len];
    let read = channel.read_at(&mut buf, 0).expect("Failed to read");
    buf.truncate(read);
    channel.close().expect("Failed to close reader");
    buf
}

#[test]
fn test_multi_chunk_content_survives_reopen() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let content = pattern(3 * CLEARTEXT_CHUNK_SIZE + 4321, 7);

    {
        let files = test_registry();
        let channel = files.open(&path, rw()).expect("Failed to open");
        channel.write_at(&content, 0).expect("Failed to write");
        channel.close().expect("Failed to close");
        assert!(files.is_empty(), "registry entry must go away on close");
    }

    // A completely fresh registry must decrypt the same content.
    let files = test_registry();
    assert_eq!(read_all(&files, &path, content.len() + 100), content);
}

#[test]
fn test_ciphertext_layout_on_disk() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let files = test_registry();

    let channel = files.open(&path, rw()).expect("Failed to open");
    let content = pattern(2 * CLEARTEXT_CHUNK_SIZE + 100, 1);
    channel.write_at(&content, 0).expect("Failed to write");
    channel.close().expect("Failed to close");

    // Header, two full chunks, one 100-byte partial chunk.
    let expected = HEADER_SIZE as u64 + 2 * CIPHERTEXT_CHUNK_SIZE as u64 + 100 + 28;
    assert_eq!(std::fs::metadata(&path).expect("Failed to stat").len(), expected);

    // Ciphertext shares no bytes with the cleartext pattern at chunk start.
    let raw = std::fs::read(&path).expect("Failed to read raw file");
    assert_ne!(&raw[HEADER_SIZE + 12..HEADER_SIZE + 12 + 64], &content[..64]);
}

#[test]
fn test_empty_file_persists_header_only() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let files = test_registry();

    let channel = files.open(&path, rw()).expect("Failed to open");
    channel.force(false).expect("Failed to flush");
    channel.close().expect("Failed to close");

    assert_eq!(
        std::fs::metadata(&path).expect("Failed to stat").len(),
        HEADER_SIZE as u64
    );

    // The header alone decodes to an empty file.
    let files = test_registry();
    assert!(read_all(&files, &path, 16).is_empty());
}

#[test]
fn test_sparse_write_reads_zeros_after_reopen() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let offset = 4 * CLEARTEXT_CHUNK_SIZE as u64 + 99;

    {
        let files = test_registry();
        let channel = files.open(&path, rw()).expect("Failed to open");
        channel.write_at(b"end", offset).expect("Failed to write");
        channel.close().expect("Failed to close");
    }

    let files = test_registry();
    let channel = files
        .open(&path, OpenOptions::new().read(true))
        .expect("Failed to reopen");
    assert_eq!(channel.size(), offset + 3);

    // Every byte of the gap authenticates and reads as zero.
    let mut buf = vec![0xAAu8; CLEARTEXT_CHUNK_SIZE];
    let mut pos = 0u64;
    while pos < offset {
        let want = buf.len().min((offset - pos) as usize);
        let read = channel
            .read_at(&mut buf[..want], pos)
            .expect("Failed to read gap");
        assert_eq!(read, want);
        assert!(buf[..read].iter().all(|&b| b == 0), "gap byte not zero at {pos}");
        pos += read as u64;
    }

    let mut tail = [0u8; 3];
    assert_eq!(channel.read_at(&mut tail, offset).expect("Failed to read tail"), 3);
    assert_eq!(&tail, b"end");
    channel.close().expect("Failed to close");
}

#[test]
fn test_truncate_shrinks_ciphertext_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let content = pattern(2 * CLEARTEXT_CHUNK_SIZE + 500, 3);

    let files = test_registry();
    let channel = files.open(&path, rw()).expect("Failed to open");
    channel.write_at(&content, 0).expect("Failed to write");
    channel.force(false).expect("Failed to flush");

    let new_size = CLEARTEXT_CHUNK_SIZE as u64 + 10;
    channel.truncate(new_size).expect("Failed to truncate");
    channel.close().expect("Failed to close");

    assert_eq!(
        std::fs::metadata(&path).expect("Failed to stat").len(),
        HEADER_SIZE as u64 + CIPHERTEXT_CHUNK_SIZE as u64 + 10 + 28
    );

    let files = test_registry();
    let survived = read_all(&files, &path, content.len());
    assert_eq!(survived.len(), new_size as usize);
    assert_eq!(survived, content[..new_size as usize]);
}

#[test]
fn test_cache_stays_within_bound_during_streaming_write() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let files = test_registry();

    let channel = files.open(&path, rw()).expect("Failed to open");
    let file = files.get(&path).expect("file must be registered");

    let chunk = pattern(CLEARTEXT_CHUNK_SIZE, 9);
    for i in 0..(3 * MAX_CACHED_CHUNKS as u64) {
        channel
            .write_at(&chunk, i * CLEARTEXT_CHUNK_SIZE as u64)
            .expect("Failed to write chunk");
        assert!(
            file.cached_chunks() <= MAX_CACHED_CHUNKS,
            "cache exceeded its bound"
        );
    }
    channel.close().expect("Failed to close");
}

#[test]
fn test_interleaved_writers_compose_one_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let files = test_registry();

    let a = files.open(&path, rw()).expect("Failed to open first channel");
    let b = files.open(&path, rw()).expect("Failed to open second channel");

    a.write_at(b"AAAA", 0).expect("Failed to write");
    b.write_at(b"BBBB", 4).expect("Failed to write");
    a.write_at(b"CCCC", 8).expect("Failed to write");

    a.close().expect("Failed to close");
    b.close().expect("Failed to close");

    let files = test_registry();
    assert_eq!(read_all(&files, &path, 16), b"AAAABBBBCCCC");
}

#[test]
fn test_corrupted_chunk_is_reported_and_others_survive() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    let content = pattern(2 * CLEARTEXT_CHUNK_SIZE, 5);

    {
        let files = test_registry();
        let channel = files.open(&path, rw()).expect("Failed to open");
        channel.write_at(&content, 0).expect("Failed to write");
        channel.close().expect("Failed to close");
    }

    // Corrupt one byte inside the second chunk's payload.
    let mut raw = std::fs::read(&path).expect("Failed to read raw file");
    let victim = HEADER_SIZE + CIPHERTEXT_CHUNK_SIZE + 100;
    raw[victim] ^= 0xFF;
    std::fs::write(&path, &raw).expect("Failed to write raw file");

    let files = test_registry();
    let channel = files
        .open(&path, OpenOptions::new().read(true))
        .expect("Failed to reopen");

    // First chunk still reads.
    let mut buf = vec![0u8; 1024];
    assert_eq!(channel.read_at(&mut buf, 0).expect("Failed to read"), 1024);
    assert_eq!(buf, content[..1024]);

    // Second chunk fails authentication.
    let err = channel
        .read_at(&mut buf, CLEARTEXT_CHUNK_SIZE as u64)
        .expect_err("corrupt chunk must not decrypt");
    assert!(matches!(err, CryptoFileError::Crypto(_)), "got {err:?}");
    channel.close().expect("Failed to close");
}

#[test]
fn test_corrupt_header_fails_open() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");

    {
        let files = test_registry();
        let channel = files.open(&path, rw()).expect("Failed to open");
        channel.write_at(b"data", 0).expect("Failed to write");
        channel.close().expect("Failed to close");
    }

    let mut raw = std::fs::read(&path).expect("Failed to read raw file");
    raw[30] ^= 0x01;
    std::fs::write(&path, &raw).expect("Failed to write raw file");

    let files = test_registry();
    let err = files
        .open(&path, OpenOptions::new().read(true))
        .expect_err("corrupt header must fail open");
    assert!(matches!(err, CryptoFileError::CorruptHeader { .. }), "got {err:?}");
    assert!(files.is_empty());
}

#[test]
fn test_wrong_master_key_fails_open() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");

    {
        let files = test_registry();
        let channel = files.open(&path, rw()).expect("Failed to open");
        channel.write_at(b"data", 0).expect("Failed to write");
        channel.close().expect("Failed to close");
    }

    let files = OpenCryptoFiles::new(Arc::new(Cryptor::new([0u8; 32])));
    let err = files
        .open(&path, OpenOptions::new().read(true))
        .expect_err("wrong key must fail open");
    assert!(matches!(err, CryptoFileError::CorruptHeader { .. }), "got {err:?}");
}

#[test]
fn test_create_new_refuses_existing_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");
    std::fs::write(&path, b"occupied").expect("Failed to create file");

    let files = test_registry();
    let err = files
        .open(
            &path,
            OpenOptions::new().read(true).write(true).create_new(true),
        )
        .expect_err("create_new must refuse an existing file");
    assert!(matches!(err, CryptoFileError::Io(_)), "got {err:?}");
}

#[test]
fn test_writer_close_flushes_while_reader_stays_open() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("file.c9r");

    {
        let files = test_registry();
        let channel = files.open(&path, rw()).expect("Failed to open");
        channel
            .write_at(&pattern(CLEARTEXT_CHUNK_SIZE, 2), 0)
            .expect("Failed to write");
        channel.close().expect("Failed to close");
    }

    let files = test_registry();
    let reader = files
        .open(&path, OpenOptions::new().read(true))
        .expect("Failed to open reader");
    let writer = files.open(&path, rw()).expect("Failed to open writer");
    writer.write_at(b"dirty", 10).expect("Failed to write");
    writer.close().expect("Writer close must flush cleanly");

    // The surviving reader sees the flushed write through the shared state.
    let mut buf = [0u8; 5];
    assert_eq!(reader.read_at(&mut buf, 10).expect("Failed to read"), 5);
    assert_eq!(&buf, b"dirty");
    reader.close().expect("Reader close must succeed");

    let reread = test_registry();
    let content = read_all(&reread, &path, 32);
    assert_eq!(&content[10..15], b"dirty");
}
