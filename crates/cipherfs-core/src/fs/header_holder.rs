//! Lazy, once-only file header state.
//!
//! Every logical file has exactly one header for its whole open lifetime.
//! The holder defers header creation or loading until the first channel
//! actually needs it, and guarantees that concurrent initializers settle on
//! a single winner. It also tracks whether the header has reached disk yet,
//! so a freshly created header is persisted by the first flush.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::crypto::{Cryptor, FileHeader};
use crate::error::CryptoFileError;
use crate::fs::chunk_io::CiphertextChannel;

/// Holds the file header of one logical file, initialized at most once.
#[derive(Debug, Default)]
pub struct FileHeaderHolder {
    header: OnceLock<Arc<FileHeader>>,
    persisted: AtomicBool,
}

impl FileHeaderHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The header, if it has been initialized.
    pub fn get(&self) -> Result<Arc<FileHeader>, CryptoFileError> {
        self.header
            .get()
            .cloned()
            .ok_or(CryptoFileError::HeaderNotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.header.get().is_some()
    }

    /// Create a fresh header for a new file.
    ///
    /// If another thread initialized the header first, its header wins and
    /// is returned instead. The header is not yet persisted; the first
    /// flush writes it.
    pub fn create_new(&self, cryptor: &Cryptor) -> Arc<FileHeader> {
        let header = self
            .header
            .get_or_init(|| Arc::new(cryptor.create_header()));
        Arc::clone(header)
    }

    /// Load and decrypt the header from the start of an existing ciphertext
    /// file.
    ///
    /// If another thread initialized the header first, its header wins. A
    /// loaded header is already on disk and marked persisted.
    pub fn load_existing(
        &self,
        cryptor: &Cryptor,
        channel: &CiphertextChannel,
        path: &Path,
    ) -> Result<Arc<FileHeader>, CryptoFileError> {
        if let Some(header) = self.header.get() {
            return Ok(Arc::clone(header));
        }

        let mut encrypted = vec![0u8; cryptor.header_size()];
        channel.read_exact_at(&mut encrypted, 0)?;
        let header = cryptor
            .decrypt_header(&encrypted)
            .map_err(|source| CryptoFileError::CorruptHeader {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "loaded file header");

        let header = self.header.get_or_init(|| Arc::new(header));
        self.persisted.store(true, Ordering::Release);
        Ok(Arc::clone(header))
    }

    /// Whether the current header has been written to disk.
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// Record that the header has reached disk.
    pub fn mark_persisted(&self) {
        self.persisted.store(true, Ordering::Release);
    }
}
