//! Encrypted random-access file I/O.
//!
//! Files are stored as ciphertext: a 68-byte encrypted header carrying a
//! per-file content key, followed by independently authenticated 32 KiB
//! chunks. This crate exposes positional read/write channels over that
//! format, with a shared per-file chunk cache, write-back on eviction and
//! registry-level support for delete and two-phase move of open files.
//!
//! ```no_run
//! use cipherfs_core::crypto::Cryptor;
//! use cipherfs_core::fs::{OpenCryptoFiles, OpenOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), cipherfs_core::error::CryptoFileError> {
//! let files = OpenCryptoFiles::new(Arc::new(Cryptor::new([0u8; 32])));
//! let channel = files.open(
//!     Path::new("/vault/d/AB/file.c9r"),
//!     OpenOptions::new().read(true).write(true).create(true),
//! )?;
//! channel.write_at(b"hello", 0)?;
//! channel.close()?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod fs;

pub use crypto::Cryptor;
pub use error::CryptoFileError;
pub use fs::{CleartextFileChannel, OpenCryptoFile, OpenCryptoFiles, OpenOptions};
