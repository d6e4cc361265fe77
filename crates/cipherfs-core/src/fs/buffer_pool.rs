//! Reusable chunk buffers.
//!
//! Loading and saving chunks needs one ciphertext-sized and one
//! cleartext-sized scratch buffer per operation. The pool recycles them to
//! avoid re-allocating 32 KiB buffers on every cache miss. Pooling is a pure
//! optimization: dropping a buffer instead of recycling it is always safe.

use std::sync::Mutex;

use crate::crypto::Cryptor;

/// Buffers retained per size class; anything beyond this is dropped.
const MAX_POOLED: usize = 16;

/// Free-list pool of size-matched, pre-cleared chunk buffers.
pub struct BufferPool {
    cleartext_size: usize,
    ciphertext_size: usize,
    cleartext: Mutex<Vec<Vec<u8>>>,
    ciphertext: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(cryptor: &Cryptor) -> Self {
        Self {
            cleartext_size: cryptor.cleartext_chunk_size(),
            ciphertext_size: cryptor.ciphertext_chunk_size(),
            cleartext: Mutex::new(Vec::new()),
            ciphertext: Mutex::new(Vec::new()),
        }
    }

    /// A zeroed buffer of the cleartext chunk size.
    pub fn get_cleartext_buffer(&self) -> Vec<u8> {
        Self::take(&self.cleartext, self.cleartext_size)
    }

    /// A zeroed buffer of the ciphertext chunk size.
    pub fn get_ciphertext_buffer(&self) -> Vec<u8> {
        Self::take(&self.ciphertext, self.ciphertext_size)
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is matched to a size class by capacity; buffers of any
    /// other capacity are dropped.
    pub fn recycle(&self, buffer: Vec<u8>) {
        let pool = if buffer.capacity() == self.cleartext_size {
            &self.cleartext
        } else if buffer.capacity() == self.ciphertext_size {
            &self.ciphertext
        } else {
            return;
        };
        let mut pool = pool.lock().unwrap();
        if pool.len() < MAX_POOLED {
            pool.push(buffer);
        }
    }

    fn take(pool: &Mutex<Vec<Vec<u8>>>, size: usize) -> Vec<u8> {
        if let Some(mut buffer) = pool.lock().unwrap().pop() {
            buffer.clear();
            buffer.resize(size, 0);
            buffer
        } else {
            vec![0u8; size]
        }
    }
}
