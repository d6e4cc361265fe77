//! Ciphertext channel multiplexing.
//!
//! Every cleartext channel opened on a logical file owns one physical
//! channel to the same ciphertext file. [`ChunkIo`] holds the set of
//! channels currently registered for the file and lets the chunk cache
//! perform reads and writes through an arbitrary suitable member, so chunk
//! I/O keeps working as individual channels come and go.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::CryptoFileError;

/// A physical byte-range channel to a ciphertext file.
///
/// Positional reads and writes serialize on an internal mutex; distinct
/// channels to the same file do not block each other.
#[derive(Debug)]
pub struct CiphertextChannel {
    file: Mutex<File>,
    readable: bool,
    writable: bool,
}

impl CiphertextChannel {
    pub fn new(file: File, readable: bool, writable: bool) -> Self {
        Self {
            file: Mutex::new(file),
            readable,
            writable,
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short only at end of data.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Write all of `buf` starting at `offset`.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    /// Current size of the ciphertext file in bytes.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.lock().unwrap().metadata()?.len())
    }

    /// Shrink the ciphertext file to `len` bytes.
    pub fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.lock().unwrap().set_len(len)
    }

    /// Flush file content and metadata to the storage device.
    pub fn sync(&self) -> io::Result<()> {
        self.file.lock().unwrap().sync_all()
    }

    /// Set the modification time of the ciphertext file.
    pub fn set_modified(&self, time: SystemTime) -> io::Result<()> {
        self.file.lock().unwrap().set_modified(time)
    }
}

/// Registered ciphertext channels of one logical file.
///
/// Registration hands out a unique id (monotonically increasing, never
/// reused) used to unregister the channel on close. All members refer to
/// the same underlying file, so delegation picks an arbitrary channel from
/// the right capability set.
#[derive(Debug, Default)]
pub struct ChunkIo {
    channels: DashMap<u64, Arc<CiphertextChannel>>,
    next_id: AtomicU64,
}

impl ChunkIo {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a channel and return its id.
    pub fn register(&self, channel: Arc<CiphertextChannel>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels.insert(id, channel);
        id
    }

    /// Unregister a channel by id.
    pub fn unregister(&self, id: u64) -> Option<Arc<CiphertextChannel>> {
        self.channels.remove(&id).map(|(_, channel)| channel)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Read via an arbitrary readable channel.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, CryptoFileError> {
        let channel = self.any_channel(CiphertextChannel::readable, CryptoFileError::NonReadable)?;
        Ok(channel.read_at(buf, offset)?)
    }

    /// Write via an arbitrary writable channel.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<(), CryptoFileError> {
        let channel = self.any_channel(CiphertextChannel::writable, CryptoFileError::NonWritable)?;
        Ok(channel.write_all_at(buf, offset)?)
    }

    /// Ciphertext file size via an arbitrary channel.
    pub fn size(&self) -> Result<u64, CryptoFileError> {
        let channel = self.any_channel(|_| true, CryptoFileError::NonReadable)?;
        Ok(channel.size()?)
    }

    fn any_channel(
        &self,
        suitable: impl Fn(&CiphertextChannel) -> bool,
        otherwise: CryptoFileError,
    ) -> Result<Arc<CiphertextChannel>, CryptoFileError> {
        self.channels
            .iter()
            .find(|entry| suitable(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(otherwise)
    }
}
