//! Per-file shared state.
//!
//! One [`OpenCryptoFile`] exists per logical file while any channel to it
//! is open. It owns the single header, chunk cache, channel registry and
//! scheduling lock that all channels to that file share, tracks the
//! cleartext size and pending timestamps, and removes itself from the
//! global registry when its last channel closes.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::crypto::Cryptor;
use crate::error::CryptoFileError;
use crate::fs::buffer_pool::BufferPool;
use crate::fs::channel::CleartextFileChannel;
use crate::fs::chunk_cache::ChunkCache;
use crate::fs::chunk_io::{ChunkIo, CiphertextChannel};
use crate::fs::header_holder::FileHeaderHolder;
use crate::fs::open_files::OpenCryptoFiles;
use crate::fs::priority_lock::PriorityMutex;
use crate::fs::write_errors::WriteBackErrors;

/// Cleartext size before any channel has determined it.
const SIZE_UNKNOWN: i64 = -1;

/// How a cleartext channel is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    create_new: bool,
    truncate_existing: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    pub fn truncate_existing(mut self, truncate: bool) -> Self {
        self.truncate_existing = truncate;
        self
    }

    pub fn readable(&self) -> bool {
        self.read
    }

    pub fn writable(&self) -> bool {
        self.write
    }

    pub fn creates(&self) -> bool {
        self.create
    }

    pub fn creates_new(&self) -> bool {
        self.create_new
    }

    pub fn truncates_existing(&self) -> bool {
        self.truncate_existing
    }
}

#[derive(Debug)]
struct PathState {
    path: PathBuf,
    deleted: bool,
}

/// Shared state of one open logical file.
pub struct OpenCryptoFile {
    cryptor: Arc<Cryptor>,
    path: Mutex<PathState>,
    header: Arc<FileHeaderHolder>,
    chunk_io: Arc<ChunkIo>,
    chunk_cache: Arc<ChunkCache>,
    buffer_pool: Arc<BufferPool>,
    write_errors: Arc<WriteBackErrors>,
    lock: PriorityMutex,
    size: AtomicI64,
    last_modified: Mutex<Option<SystemTime>>,
    open_channels: AtomicUsize,
    // Serializes header and size initialization across concurrent opens.
    open_mutex: Mutex<()>,
    registry: Weak<OpenCryptoFiles>,
}

impl OpenCryptoFile {
    /// Construct the shared state without touching the filesystem. I/O
    /// happens when the first channel is opened.
    pub(crate) fn new(
        cryptor: Arc<Cryptor>,
        path: PathBuf,
        registry: Weak<OpenCryptoFiles>,
    ) -> Arc<Self> {
        let header = Arc::new(FileHeaderHolder::new());
        let chunk_io = Arc::new(ChunkIo::new());
        let buffer_pool = Arc::new(BufferPool::new(&cryptor));
        let write_errors = Arc::new(WriteBackErrors::new());
        let chunk_cache = Arc::new(ChunkCache::new(
            Arc::clone(&cryptor),
            Arc::clone(&chunk_io),
            Arc::clone(&header),
            Arc::clone(&buffer_pool),
            Arc::clone(&write_errors),
        ));
        Arc::new(Self {
            cryptor,
            path: Mutex::new(PathState {
                path,
                deleted: false,
            }),
            header,
            chunk_io,
            chunk_cache,
            buffer_pool,
            write_errors,
            lock: PriorityMutex::new(),
            size: AtomicI64::new(SIZE_UNKNOWN),
            last_modified: Mutex::new(None),
            open_channels: AtomicUsize::new(0),
            open_mutex: Mutex::new(()),
            registry,
        })
    }

    /// Open a new cleartext channel to this file.
    ///
    /// The first channel initializes the header (creating a fresh one for
    /// an empty file, decrypting it otherwise) and the cleartext size;
    /// later channels reuse both.
    pub fn new_file_channel(
        self: &Arc<Self>,
        options: OpenOptions,
    ) -> Result<CleartextFileChannel, CryptoFileError> {
        let path = {
            let state = self.path.lock().unwrap();
            if state.deleted {
                return Err(CryptoFileError::FileDeleted {
                    path: state.path.clone(),
                });
            }
            state.path.clone()
        };

        // Counted before opening so a concurrent close of the last other
        // channel cannot tear the file down underneath us.
        self.open_channels.fetch_add(1, Ordering::SeqCst);
        match self.open_channel(&path, options) {
            Ok(channel) => {
                if options.truncates_existing() {
                    // On failure the channel is dropped, and its close path
                    // rolls the channel count back.
                    channel.truncate(0)?;
                }
                Ok(channel)
            }
            Err(e) => {
                if self.open_channels.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.close();
                }
                Err(e)
            }
        }
    }

    fn open_channel(
        self: &Arc<Self>,
        path: &Path,
        options: OpenOptions,
    ) -> Result<CleartextFileChannel, CryptoFileError> {
        // The ciphertext file is always opened readable: partial-chunk
        // writes need to read the rest of the chunk even on a write-only
        // cleartext channel.
        let file = File::options()
            .read(true)
            .write(options.writable())
            .create(options.creates() && options.writable())
            .create_new(options.creates_new())
            .open(path)?;
        let channel = Arc::new(CiphertextChannel::new(file, true, options.writable()));

        {
            let _guard = self.open_mutex.lock().unwrap();
            let ciphertext_len = channel.size()?;
            if ciphertext_len == 0 {
                self.header.create_new(&self.cryptor);
                self.init_size(0);
            } else {
                self.header.load_existing(&self.cryptor, &channel, path)?;
                let payload = ciphertext_len.saturating_sub(self.cryptor.header_size() as u64);
                let size = self.cryptor.cleartext_size(payload).unwrap_or_else(|| {
                    warn!(
                        path = %path.display(),
                        ciphertext_len,
                        "ciphertext length matches no valid chunk layout, assuming empty file"
                    );
                    0
                });
                self.init_size(size);
            }
        }

        let channel_id = self.chunk_io.register(Arc::clone(&channel));
        debug!(path = %path.display(), channel = channel_id, "opened cleartext channel");
        Ok(CleartextFileChannel::new(
            Arc::clone(self),
            channel,
            channel_id,
            options,
        ))
    }

    fn init_size(&self, size: u64) {
        let _ = self.size.compare_exchange(
            SIZE_UNKNOWN,
            size as i64,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Cleartext size, or `None` before the first channel determined it.
    pub fn size(&self) -> Option<u64> {
        let size = self.size.load(Ordering::SeqCst);
        (size >= 0).then_some(size as u64)
    }

    /// Grow the cleartext size to at least `minimum`.
    pub(crate) fn grow_size(&self, minimum: u64) {
        self.size.fetch_max(minimum as i64, Ordering::SeqCst);
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size as i64, Ordering::SeqCst);
    }

    /// Last modification time: the pending in-memory timestamp if content
    /// was written, the ciphertext file's otherwise.
    pub fn last_modified_time(&self) -> Result<SystemTime, CryptoFileError> {
        if let Some(time) = *self.last_modified.lock().unwrap() {
            return Ok(time);
        }
        let path = {
            let state = self.path.lock().unwrap();
            state.path.clone()
        };
        Ok(std::fs::metadata(path)?.modified()?)
    }

    pub fn set_last_modified_time(&self, time: SystemTime) {
        *self.last_modified.lock().unwrap() = Some(time);
    }

    /// Record a content modification at the current time.
    pub(crate) fn touch(&self) {
        self.set_last_modified_time(SystemTime::now());
    }

    pub(crate) fn pending_modified_time(&self) -> Option<SystemTime> {
        *self.last_modified.lock().unwrap()
    }

    /// The ciphertext path this file currently lives at, or `None` once
    /// deleted.
    pub fn current_file_path(&self) -> Option<PathBuf> {
        let state = self.path.lock().unwrap();
        (!state.deleted).then(|| state.path.clone())
    }

    /// Reflect a committed move. A no-op after deletion, so a file deleted
    /// mid-move stays deleted.
    pub(crate) fn update_current_file_path(&self, new_path: PathBuf) {
        let mut state = self.path.lock().unwrap();
        if !state.deleted {
            state.path = new_path;
        }
    }

    pub(crate) fn mark_deleted(&self) {
        self.path.lock().unwrap().deleted = true;
    }

    /// Number of currently open cleartext channels.
    pub fn open_channel_count(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    /// Number of chunks currently held in this file's cache.
    pub fn cached_chunks(&self) -> usize {
        self.chunk_cache.cached_chunks()
    }

    /// Called by a channel after it closed; the last channel tears the
    /// file down.
    pub(crate) fn channel_closed(self: &Arc<Self>) {
        if self.open_channels.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    fn close(self: &Arc<Self>) {
        debug!("last channel closed, removing open file");
        self.chunk_cache.invalidate_all();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_same(self);
        }
    }

    /// Flush cached state without registry bookkeeping. Used when the
    /// whole registry shuts down.
    pub(crate) fn force_close(&self) {
        self.chunk_cache.invalidate_all();
    }

    pub(crate) fn cryptor(&self) -> &Cryptor {
        &self.cryptor
    }

    pub(crate) fn header_holder(&self) -> &FileHeaderHolder {
        &self.header
    }

    pub(crate) fn cache(&self) -> &ChunkCache {
        &self.chunk_cache
    }

    pub(crate) fn chunk_io(&self) -> &ChunkIo {
        &self.chunk_io
    }

    pub(crate) fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub(crate) fn write_errors(&self) -> &WriteBackErrors {
        &self.write_errors
    }

    pub(crate) fn lock(&self) -> &PriorityMutex {
        &self.lock
    }
}
