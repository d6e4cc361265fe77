//! Bounded write-back chunk cache.
//!
//! Holds up to [`MAX_CACHED_CHUNKS`] decrypted chunks per file in LRU
//! order. Misses load and decrypt through [`ChunkIo`]; a chunk being
//! loaded by one thread is never loaded a second time by another, waiters
//! block until the single in-flight load finishes. Dirty chunks are
//! encrypted and written back when evicted or when the cache is
//! invalidated; write-back failures on evicting threads are deferred to
//! [`WriteBackErrors`] instead of surfacing to the unrelated caller.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};

use lru::LruCache;
use tracing::{debug, trace};

use crate::crypto::Cryptor;
use crate::error::CryptoFileError;
use crate::fs::buffer_pool::BufferPool;
use crate::fs::chunk::{Chunk, SharedChunk};
use crate::fs::chunk_io::ChunkIo;
use crate::fs::header_holder::FileHeaderHolder;
use crate::fs::write_errors::WriteBackErrors;

/// Maximum number of decrypted chunks cached per file.
pub const MAX_CACHED_CHUNKS: usize = 5;

struct CacheState {
    chunks: LruCache<u64, SharedChunk>,
    loading: HashSet<u64>,
}

/// Per-file chunk cache with single-flight loads and write-back eviction.
pub struct ChunkCache {
    cryptor: Arc<Cryptor>,
    chunk_io: Arc<ChunkIo>,
    header: Arc<FileHeaderHolder>,
    buffer_pool: Arc<BufferPool>,
    write_errors: Arc<WriteBackErrors>,
    state: Mutex<CacheState>,
    load_finished: Condvar,
}

impl ChunkCache {
    pub fn new(
        cryptor: Arc<Cryptor>,
        chunk_io: Arc<ChunkIo>,
        header: Arc<FileHeaderHolder>,
        buffer_pool: Arc<BufferPool>,
        write_errors: Arc<WriteBackErrors>,
    ) -> Self {
        let capacity = NonZeroUsize::new(MAX_CACHED_CHUNKS)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            cryptor,
            chunk_io,
            header,
            buffer_pool,
            write_errors,
            state: Mutex::new(CacheState {
                chunks: LruCache::new(capacity),
                loading: HashSet::new(),
            }),
            load_finished: Condvar::new(),
        }
    }

    /// Fetch the chunk at `index`, loading and decrypting it on a miss.
    ///
    /// Concurrent misses on the same index perform one load; the others
    /// wait for it. A miss past the end of the ciphertext file yields an
    /// empty chunk.
    pub fn get(&self, index: u64) -> Result<SharedChunk, CryptoFileError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(chunk) = state.chunks.get(&index) {
                trace!(chunk = index, "chunk cache hit");
                return Ok(Arc::clone(chunk));
            }
            if state.loading.contains(&index) {
                state = self.load_finished.wait(state).unwrap();
            } else {
                break;
            }
        }
        state.loading.insert(index);
        drop(state);

        let loaded = self.load_chunk(index);

        let mut state = self.state.lock().unwrap();
        state.loading.remove(&index);
        self.load_finished.notify_all();

        let loaded = loaded?;
        if let Some(chunk) = state.chunks.get(&index) {
            // A concurrent set() landed while the load was in flight; its
            // chunk supersedes the stale decrypted content.
            let chunk = Arc::clone(chunk);
            drop(state);
            self.buffer_pool.recycle(loaded.into_bytes());
            return Ok(chunk);
        }
        let chunk = Arc::new(Mutex::new(loaded));
        let evicted = state.chunks.push(index, Arc::clone(&chunk));
        drop(state);
        self.handle_eviction(index, evicted);
        Ok(chunk)
    }

    /// Install `chunk` at `index`, replacing whatever was cached there.
    ///
    /// Used for whole-chunk overwrites, where the previous content is
    /// superseded without ever being loaded.
    pub fn set(&self, index: u64, chunk: Chunk) {
        let chunk = Arc::new(Mutex::new(chunk));
        let evicted = self.state.lock().unwrap().chunks.push(index, chunk);
        self.handle_eviction(index, evicted);
    }

    /// Write back every dirty chunk and empty the cache.
    ///
    /// Write-back failures are deferred to the error collector; callers
    /// that need them surface them via
    /// [`WriteBackErrors::throw_if_present`].
    pub fn invalidate_all(&self) {
        let drained: Vec<(u64, SharedChunk)> = {
            let mut state = self.state.lock().unwrap();
            let mut drained = Vec::with_capacity(state.chunks.len());
            while let Some(entry) = state.chunks.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        for (index, chunk) in drained {
            self.write_back(index, &chunk);
            self.reclaim(chunk);
        }
    }

    /// Number of chunks currently cached.
    pub fn cached_chunks(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    fn handle_eviction(&self, inserted: u64, evicted: Option<(u64, SharedChunk)>) {
        if let Some((index, chunk)) = evicted {
            // A same-index replacement is a deliberate overwrite; the old
            // content must not be written back over the new.
            if index == inserted {
                self.reclaim(chunk);
                return;
            }
            debug!(chunk = index, "evicting cached chunk");
            self.write_back(index, &chunk);
            self.reclaim(chunk);
        }
    }

    fn write_back(&self, index: u64, chunk: &SharedChunk) {
        let mut guard = chunk.lock().unwrap();
        if !guard.is_dirty() {
            return;
        }
        match self.save_chunk(index, guard.data()) {
            Ok(()) => guard.mark_clean(),
            Err(e) => self.write_errors.add(e),
        }
    }

    fn load_chunk(&self, index: u64) -> Result<Chunk, CryptoFileError> {
        let offset = self.chunk_offset(index);
        let mut ciphertext = self.buffer_pool.get_ciphertext_buffer();
        let read = self.chunk_io.read(&mut ciphertext, offset)?;

        let chunk = if read == 0 {
            // Past the end of the ciphertext file.
            trace!(chunk = index, "loading chunk past EOF as empty");
            Chunk::new(self.buffer_pool.get_cleartext_buffer(), 0)
        } else {
            let header = self.header.get()?;
            let cleartext = self
                .cryptor
                .decrypt_chunk(&ciphertext[..read], index, &header)?;
            let mut bytes = self.buffer_pool.get_cleartext_buffer();
            bytes[..cleartext.len()].copy_from_slice(&cleartext);
            Chunk::new(bytes, cleartext.len())
        };
        self.buffer_pool.recycle(ciphertext);
        Ok(chunk)
    }

    fn save_chunk(&self, index: u64, cleartext: &[u8]) -> Result<(), CryptoFileError> {
        let header = self.header.get()?;
        let encrypted = self.cryptor.encrypt_chunk(cleartext, index, &header)?;
        self.chunk_io.write(&encrypted, self.chunk_offset(index))
    }

    fn chunk_offset(&self, index: u64) -> u64 {
        self.cryptor.header_size() as u64
            + index * self.cryptor.ciphertext_chunk_size() as u64
    }

    fn reclaim(&self, chunk: SharedChunk) {
        if let Ok(inner) = Arc::try_unwrap(chunk) {
            if let Ok(chunk) = inner.into_inner() {
                self.buffer_pool.recycle(chunk.into_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        cryptor: Arc<Cryptor>,
        chunk_io: Arc<ChunkIo>,
        header: Arc<FileHeaderHolder>,
        buffer_pool: Arc<BufferPool>,
        write_errors: Arc<WriteBackErrors>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.path().join("file.c9r"))
                .unwrap();
            let cryptor = Arc::new(Cryptor::new([3u8; 32]));
            let chunk_io = Arc::new(ChunkIo::new());
            chunk_io.register(Arc::new(crate::fs::chunk_io::CiphertextChannel::new(
                file, true, true,
            )));
            let header = Arc::new(FileHeaderHolder::new());
            header.create_new(&cryptor);
            Self {
                _dir: dir,
                buffer_pool: Arc::new(BufferPool::new(&cryptor)),
                cryptor,
                chunk_io,
                header,
                write_errors: Arc::new(WriteBackErrors::new()),
            }
        }

        fn cache(&self) -> ChunkCache {
            ChunkCache::new(
                Arc::clone(&self.cryptor),
                Arc::clone(&self.chunk_io),
                Arc::clone(&self.header),
                Arc::clone(&self.buffer_pool),
                Arc::clone(&self.write_errors),
            )
        }

        fn dirty_chunk(&self, data: &[u8]) -> Chunk {
            let mut bytes = self.buffer_pool.get_cleartext_buffer();
            bytes[..data.len()].copy_from_slice(data);
            Chunk::new_dirty(bytes, data.len())
        }
    }

    #[test]
    fn miss_past_eof_yields_empty_chunk() {
        let fx = Fixture::new();
        let cache = fx.cache();
        let chunk = cache.get(7).unwrap();
        assert!(chunk.lock().unwrap().is_empty());
        assert!(!chunk.lock().unwrap().is_dirty());
    }

    #[test]
    fn repeated_get_returns_cached_instance() {
        let fx = Fixture::new();
        let cache = fx.cache();
        let first = cache.get(0).unwrap();
        let second = cache.get(0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.cached_chunks(), 1);
    }

    #[test]
    fn invalidate_persists_dirty_chunks() {
        let fx = Fixture::new();
        let cache = fx.cache();
        cache.set(0, fx.dirty_chunk(b"persisted data"));
        cache.invalidate_all();
        assert_eq!(cache.cached_chunks(), 0);

        // A fresh cache over the same file sees the data.
        let reread = fx.cache();
        let chunk = reread.get(0).unwrap();
        assert_eq!(chunk.lock().unwrap().data(), b"persisted data");
        fx.write_errors.throw_if_present().unwrap();
    }

    #[test]
    fn cache_never_exceeds_capacity() {
        let fx = Fixture::new();
        let cache = fx.cache();
        for i in 0..(MAX_CACHED_CHUNKS as u64 + 3) {
            cache.set(i, fx.dirty_chunk(&[i as u8; 10]));
            assert!(cache.cached_chunks() <= MAX_CACHED_CHUNKS);
        }
        assert_eq!(cache.cached_chunks(), MAX_CACHED_CHUNKS);
    }

    #[test]
    fn eviction_writes_back_dirty_chunk() {
        let fx = Fixture::new();
        let cache = fx.cache();
        cache.set(0, fx.dirty_chunk(b"first chunk"));
        // Push enough chunks to evict index 0.
        for i in 1..=(MAX_CACHED_CHUNKS as u64) {
            cache.set(i, fx.dirty_chunk(b"filler"));
        }
        assert_eq!(cache.cached_chunks(), MAX_CACHED_CHUNKS);

        let chunk = cache.get(0).unwrap();
        assert_eq!(chunk.lock().unwrap().data(), b"first chunk");
        fx.write_errors.throw_if_present().unwrap();
    }

    #[test]
    fn same_index_overwrite_discards_old_content() {
        let fx = Fixture::new();
        let cache = fx.cache();
        cache.set(0, fx.dirty_chunk(b"old"));
        cache.set(0, fx.dirty_chunk(b"new"));
        cache.invalidate_all();

        let reread = fx.cache();
        let chunk = reread.get(0).unwrap();
        assert_eq!(chunk.lock().unwrap().data(), b"new");
    }

    #[test]
    fn write_back_failure_is_deferred_not_raised() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ro.c9r"), []).unwrap();
        let file = File::open(dir.path().join("ro.c9r")).unwrap();

        let cryptor = Arc::new(Cryptor::new([3u8; 32]));
        let chunk_io = Arc::new(ChunkIo::new());
        chunk_io.register(Arc::new(crate::fs::chunk_io::CiphertextChannel::new(
            file, true, false,
        )));
        let header = Arc::new(FileHeaderHolder::new());
        header.create_new(&cryptor);
        let buffer_pool = Arc::new(BufferPool::new(&cryptor));
        let write_errors = Arc::new(WriteBackErrors::new());
        let cache = ChunkCache::new(
            Arc::clone(&cryptor),
            chunk_io,
            header,
            Arc::clone(&buffer_pool),
            Arc::clone(&write_errors),
        );

        let mut bytes = buffer_pool.get_cleartext_buffer();
        bytes[..4].copy_from_slice(b"data");
        cache.set(0, Chunk::new_dirty(bytes, 4));
        // Invalidation must not fail; the error is collected instead.
        cache.invalidate_all();

        match write_errors.throw_if_present() {
            Err(CryptoFileError::DeferredWriteBack { count, .. }) => assert_eq!(count, 1),
            other => panic!("expected deferred write-back error, got {other:?}"),
        }
    }

    #[test]
    fn set_racing_an_inflight_load_is_not_lost() {
        let fx = Fixture::new();
        {
            let cache = fx.cache();
            cache.set(0, fx.dirty_chunk(b"old"));
            cache.invalidate_all();
        }

        // Race a cold miss against an overwrite of the same index. Whatever
        // order they land in, the overwrite must end up cached: the loader
        // must never re-install the stale decrypted chunk over it.
        for _ in 0..200 {
            let cache = Arc::new(fx.cache());
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let loader = {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get(0).unwrap();
                })
            };
            barrier.wait();
            cache.set(0, fx.dirty_chunk(b"new"));
            loader.join().unwrap();

            let chunk = cache.get(0).unwrap();
            assert_eq!(
                chunk.lock().unwrap().data(),
                b"new",
                "overwrite was acknowledged but the in-flight load clobbered it"
            );
        }
    }

    #[test]
    fn corrupt_chunk_surfaces_on_load() {
        let fx = Fixture::new();
        let cache = fx.cache();
        cache.set(0, fx.dirty_chunk(b"chunk"));
        cache.invalidate_all();

        // Flip a ciphertext byte behind the cache's back.
        let offset = fx.cryptor.header_size() as u64 + 5;
        let mut byte = [0u8; 1];
        fx.chunk_io.read(&mut byte, offset).unwrap();
        byte[0] ^= 0xFF;
        fx.chunk_io.write(&byte, offset).unwrap();

        let reread = fx.cache();
        assert!(matches!(
            reread.get(0),
            Err(CryptoFileError::Crypto(_))
        ));
    }
}
