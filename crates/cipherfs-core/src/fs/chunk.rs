//! In-memory cleartext chunk.
//!
//! A chunk buffers the cleartext of one fixed-size slice of the file.
//! Its backing buffer always has full chunk capacity; `length` tracks how
//! much of it is valid data, and everything past `length` is kept zeroed so
//! that growing a chunk never exposes stale bytes.

use std::sync::{Arc, Mutex};

/// A cached cleartext chunk shared between the cache and I/O paths.
pub type SharedChunk = Arc<Mutex<Chunk>>;

#[derive(Debug)]
pub struct Chunk {
    bytes: Vec<u8>,
    length: usize,
    dirty: bool,
}

impl Chunk {
    /// Wrap a full-capacity buffer holding `length` valid bytes, clean.
    ///
    /// The caller guarantees `bytes[length..]` is zeroed.
    pub fn new(bytes: Vec<u8>, length: usize) -> Self {
        debug_assert!(length <= bytes.len());
        debug_assert!(bytes[length..].iter().all(|&b| b == 0));
        Self {
            bytes,
            length,
            dirty: false,
        }
    }

    /// Like [`Chunk::new`] but already dirty, for freshly written chunks
    /// that have never been on disk.
    pub fn new_dirty(bytes: Vec<u8>, length: usize) -> Self {
        let mut chunk = Self::new(bytes, length);
        chunk.dirty = true;
        chunk
    }

    /// Number of valid cleartext bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The valid cleartext bytes.
    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.length]
    }

    /// Copy `src` into the chunk at `offset`, growing the valid length if
    /// the write extends past it. Marks the chunk dirty.
    ///
    /// Any gap between the old length and `offset` is already zero by the
    /// buffer invariant, so sparse in-chunk writes read back as zeros.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        let end = offset + src.len();
        debug_assert!(end <= self.bytes.len());
        self.bytes[offset..end].copy_from_slice(src);
        self.length = self.length.max(end);
        self.dirty = true;
    }

    /// Shrink the valid length to `new_len`, zeroing the cut-off tail.
    /// Marks the chunk dirty. A no-op if the chunk is already shorter.
    pub fn truncate(&mut self, new_len: usize) {
        if new_len >= self.length {
            return;
        }
        self.bytes[new_len..self.length].fill(0);
        self.length = new_len;
        self.dirty = true;
    }

    /// Zero-extend the valid length to `len`. Marks the chunk dirty.
    /// A no-op if the chunk is already at least that long.
    pub fn extend_to(&mut self, len: usize) {
        debug_assert!(len <= self.bytes.len());
        if len <= self.length {
            return;
        }
        // Bytes past the old length are zero already.
        self.length = len;
        self.dirty = true;
    }

    /// Clear the dirty flag after a successful write-back.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Consume the chunk and return its backing buffer for recycling.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
