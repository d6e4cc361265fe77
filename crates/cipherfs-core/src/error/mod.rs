//! Error types for the encrypted file I/O engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use crate::crypto::CryptoError;

/// Errors surfaced by the open-file engine.
///
/// Corruption (failed authentication), physical I/O failures and
/// concurrent-use conflicts are distinct variants because remediation
/// differs: corruption is never retried, I/O failures may be, and
/// conflicts are recoverable by the caller.
#[derive(Error, Debug)]
pub enum CryptoFileError {
    /// Underlying ciphertext I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file header failed to authenticate or parse.
    #[error("corrupt file header in {path}: {source}")]
    CorruptHeader {
        path: PathBuf,
        #[source]
        source: CryptoError,
    },

    /// Header or chunk cryptography failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The file header was accessed before `create_new` or `load_existing`.
    #[error("file header accessed before initialization")]
    HeaderNotInitialized,

    /// A channel was requested for a file that has already been deleted.
    #[error("file already deleted: {path}")]
    FileDeleted { path: PathBuf },

    /// Operation on a channel that has already been closed.
    #[error("channel already closed")]
    ChannelClosed,

    /// No channel suitable for reading.
    #[error("channel is not readable")]
    NonReadable,

    /// No channel suitable for writing.
    #[error("channel is not writable")]
    NonWritable,

    /// Move destination is already in use by a different open file.
    #[error("destination already in use by another open file: {path}")]
    AlreadyExists { path: PathBuf },

    /// One or more chunk write-backs failed since the last flush.
    ///
    /// Write-back runs on evicting threads and never fails there; the
    /// collected causes are re-surfaced here at the next flush or close.
    #[error("write-back of {count} cached chunk(s) failed")]
    DeferredWriteBack {
        count: usize,
        causes: Vec<CryptoFileError>,
    },
}
