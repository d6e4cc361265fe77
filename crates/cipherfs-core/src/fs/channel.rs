//! Cleartext file channels.
//!
//! A [`CleartextFileChannel`] gives positional read and write access to
//! the decrypted content of one file. All channels to the same file share
//! the per-file state in [`OpenCryptoFile`]; chunk-level reads and writes
//! take regular tokens on the file's scheduling lock, while truncate,
//! flush and close take priority tokens so they cannot starve behind
//! streaming I/O.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::error::CryptoFileError;
use crate::fs::chunk::Chunk;
use crate::fs::chunk_io::CiphertextChannel;
use crate::fs::open_file::{OpenCryptoFile, OpenOptions};

pub struct CleartextFileChannel {
    file: Arc<OpenCryptoFile>,
    channel: Arc<CiphertextChannel>,
    channel_id: u64,
    options: OpenOptions,
    closed: AtomicBool,
}

impl fmt::Debug for CleartextFileChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleartextFileChannel")
            .field("channel_id", &self.channel_id)
            .field("options", &self.options)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl CleartextFileChannel {
    pub(crate) fn new(
        file: Arc<OpenCryptoFile>,
        channel: Arc<CiphertextChannel>,
        channel_id: u64,
        options: OpenOptions,
    ) -> Self {
        Self {
            file,
            channel,
            channel_id,
            options,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_readable(&self) -> bool {
        self.options.readable()
    }

    pub fn is_writable(&self) -> bool {
        self.options.writable()
    }

    /// Current cleartext size of the file.
    pub fn size(&self) -> u64 {
        self.file.size().unwrap_or(0)
    }

    /// Read up to `buf.len()` bytes of cleartext starting at `offset`.
    ///
    /// Returns the number of bytes read; zero at or past end of file.
    /// Bytes inside the logical size that no chunk carries (holes from
    /// sparse writes) read as zeros.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CryptoFileError> {
        if !self.options.readable() {
            return Err(CryptoFileError::NonReadable);
        }
        self.ensure_open()?;
        let _token = self.file.lock().dispense_regular();

        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;
        let chunk_size = self.file.cryptor().cleartext_chunk_size() as u64;

        let mut read = 0;
        let mut pos = offset;
        let end = offset + want as u64;
        while pos < end {
            let index = pos / chunk_size;
            let chunk_offset = (pos % chunk_size) as usize;
            let n = ((end - pos) as usize).min(chunk_size as usize - chunk_offset);

            let chunk = self.file.cache().get(index)?;
            let chunk = chunk.lock().unwrap();
            let data = chunk.data();
            let available = data.len().saturating_sub(chunk_offset);
            let copied = n.min(available);
            buf[read..read + copied]
                .copy_from_slice(&data[chunk_offset..chunk_offset + copied]);
            buf[read + copied..read + n].fill(0);

            read += n;
            pos += n as u64;
        }
        Ok(read)
    }

    /// Write all of `src` starting at `offset`, growing the file as
    /// needed. Writing past the end of file zero-fills the gap.
    ///
    /// Returns the number of bytes written, always `src.len()`.
    pub fn write_at(&self, src: &[u8], offset: u64) -> Result<usize, CryptoFileError> {
        if !self.options.writable() {
            return Err(CryptoFileError::NonWritable);
        }
        self.ensure_open()?;
        if src.is_empty() {
            return Ok(0);
        }
        let _token = self.file.lock().dispense_regular();

        let chunk_size = self.file.cryptor().cleartext_chunk_size();
        let old_size = self.size();
        if offset > old_size {
            self.fill_gap(old_size, offset)?;
        }

        let mut written = 0;
        let mut pos = offset;
        let end = offset + src.len() as u64;
        while pos < end {
            let index = pos / chunk_size as u64;
            let chunk_offset = (pos % chunk_size as u64) as usize;
            let n = ((end - pos) as usize).min(chunk_size - chunk_offset);

            if chunk_offset == 0 && n == chunk_size {
                // Whole-chunk overwrite; the previous content is
                // superseded without loading it.
                let mut bytes = self.file.buffer_pool().get_cleartext_buffer();
                bytes.copy_from_slice(&src[written..written + n]);
                self.file.cache().set(index, Chunk::new_dirty(bytes, n));
            } else {
                let chunk = self.file.cache().get(index)?;
                chunk
                    .lock()
                    .unwrap()
                    .write_at(chunk_offset, &src[written..written + n]);
            }

            written += n;
            pos += n as u64;
        }

        self.file.grow_size(end);
        self.file.touch();
        Ok(written)
    }

    /// Materialize the chunks between the old end of file and a write
    /// starting at `offset` as zeros.
    ///
    /// Every chunk below the final size must exist and authenticate, so
    /// sparse writes cannot leave physical holes.
    fn fill_gap(&self, old_size: u64, offset: u64) -> Result<(), CryptoFileError> {
        let chunk_size = self.file.cryptor().cleartext_chunk_size() as u64;
        let first_gap_chunk = old_size / chunk_size;
        let first_write_chunk = offset / chunk_size;
        for index in first_gap_chunk..first_write_chunk {
            let chunk = self.file.cache().get(index)?;
            chunk.lock().unwrap().extend_to(chunk_size as usize);
        }
        Ok(())
    }

    /// Shrink the file to `new_size`. A no-op if the file is not larger.
    pub fn truncate(&self, new_size: u64) -> Result<(), CryptoFileError> {
        if !self.options.writable() {
            return Err(CryptoFileError::NonWritable);
        }
        self.ensure_open()?;
        let _token = self.file.lock().dispense_priority();

        let old_size = self.size();
        if new_size >= old_size {
            return Ok(());
        }

        let chunk_size = self.file.cryptor().cleartext_chunk_size() as u64;
        let remainder = new_size % chunk_size;
        if remainder > 0 {
            // The new last chunk survives partially; shrink it before the
            // cache flush below writes it back.
            let chunk = self.file.cache().get(new_size / chunk_size)?;
            chunk.lock().unwrap().truncate(remainder as usize);
        }

        self.write_header()?;
        self.file.cache().invalidate_all();

        let header_size = self.file.cryptor().header_size() as u64;
        let target = header_size + self.file.cryptor().ciphertext_size(new_size);
        if target < self.channel.size()? {
            self.channel.truncate(target)?;
        }

        self.file.set_size(new_size);
        self.file.touch();
        self.file.write_errors().throw_if_present()
    }

    /// Flush cached chunks and the header, then sync the ciphertext file
    /// to the storage device. With `metadata`, pending timestamps are
    /// applied to the ciphertext file as well.
    pub fn force(&self, metadata: bool) -> Result<(), CryptoFileError> {
        self.ensure_open()?;
        let _token = self.file.lock().dispense_priority();
        self.flush(metadata)?;
        self.channel.sync()?;
        self.file.write_errors().throw_if_present()
    }

    /// Flush and close this channel. Idempotent; the last channel to
    /// close tears down the shared file state.
    pub fn close(&self) -> Result<(), CryptoFileError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let flushed = {
            let _token = self.file.lock().dispense_priority();
            self.flush(true)
        };
        // Unregister only after the flush so write-back could still go
        // through this channel.
        self.file.chunk_io().unregister(self.channel_id);
        self.file.channel_closed();
        let deferred = self.file.write_errors().throw_if_present();
        flushed.and(deferred)
    }

    fn flush(&self, metadata: bool) -> Result<(), CryptoFileError> {
        if !self.options.writable() {
            return Ok(());
        }
        self.write_header()?;
        self.file.cache().invalidate_all();
        if metadata
            && let Some(time) = self.file.pending_modified_time()
        {
            self.channel.set_modified(time)?;
        }
        Ok(())
    }

    /// Write the encrypted header at offset zero if it is not on disk yet.
    fn write_header(&self) -> Result<(), CryptoFileError> {
        if self.file.header_holder().is_persisted() {
            return Ok(());
        }
        let header = self.file.header_holder().get()?;
        let encrypted = self.file.cryptor().encrypt_header(&header)?;
        self.channel.write_all_at(&encrypted, 0)?;
        self.file.header_holder().mark_persisted();
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), CryptoFileError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CryptoFileError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for CleartextFileChannel {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("cleartext channel dropped without close, flushing best-effort");
            if let Err(e) = self.close() {
                warn!(error = %e, "flush on drop failed");
            }
        }
    }
}
