//! Registry of open files.
//!
//! Maps ciphertext paths to their [`OpenCryptoFile`] so that all channels
//! to the same path share one instance. Entries add themselves on first
//! open and remove themselves when the last channel closes; delete and
//! two-phase move keep the mapping consistent while channels stay open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, instrument};

use crate::crypto::Cryptor;
use crate::error::CryptoFileError;
use crate::fs::channel::CleartextFileChannel;
use crate::fs::open_file::{OpenCryptoFile, OpenOptions};

pub struct OpenCryptoFiles {
    cryptor: Arc<Cryptor>,
    files: DashMap<PathBuf, Arc<OpenCryptoFile>>,
}

impl OpenCryptoFiles {
    pub fn new(cryptor: Arc<Cryptor>) -> Arc<Self> {
        Arc::new(Self {
            cryptor,
            files: DashMap::new(),
        })
    }

    /// Open a cleartext channel to the file at `path`, creating or reusing
    /// the shared per-file state.
    #[instrument(skip(self, options), fields(path = %path.display()))]
    pub fn open(
        self: &Arc<Self>,
        path: &Path,
        options: OpenOptions,
    ) -> Result<CleartextFileChannel, CryptoFileError> {
        self.get_or_create(path).new_file_channel(options)
    }

    /// The open file registered at `path`, if any.
    pub fn get(&self, path: &Path) -> Option<Arc<OpenCryptoFile>> {
        self.files.get(path).map(|entry| Arc::clone(entry.value()))
    }

    /// Get or atomically create the shared state for `path`. Construction
    /// is I/O-free, so holding the map shard briefly is fine.
    pub fn get_or_create(self: &Arc<Self>, path: &Path) -> Arc<OpenCryptoFile> {
        let entry = self.files.entry(path.to_path_buf()).or_insert_with(|| {
            OpenCryptoFile::new(
                Arc::clone(&self.cryptor),
                path.to_path_buf(),
                Arc::downgrade(self),
            )
        });
        Arc::clone(entry.value())
    }

    /// Record the deletion of the file at `path`.
    ///
    /// Existing channels keep operating on the open ciphertext file; new
    /// channels to the deleted instance are refused.
    pub fn delete(&self, path: &Path) {
        if let Some((_, file)) = self.files.remove(path) {
            debug!(path = %path.display(), "marking open file deleted");
            file.mark_deleted();
        }
    }

    /// First phase of moving `src` to `dst`.
    ///
    /// If `src` is open, `dst` is reserved for it; a different open file
    /// already at `dst` fails with [`CryptoFileError::AlreadyExists`]. The
    /// returned guard must be committed after the physical move succeeded,
    /// and rolls the reservation back otherwise (also on drop).
    pub fn prepare_move(
        self: &Arc<Self>,
        src: PathBuf,
        dst: PathBuf,
    ) -> Result<TwoPhaseMove, CryptoFileError> {
        let moved = self.get(&src);
        if src != dst {
            match self.files.entry(dst.clone()) {
                Entry::Occupied(occupied) => {
                    // A busy destination blocks the move whether or not the
                    // source is open; renaming over an open file's
                    // ciphertext must never proceed.
                    let same_file = moved
                        .as_ref()
                        .is_some_and(|file| Arc::ptr_eq(occupied.get(), file));
                    if !same_file {
                        return Err(CryptoFileError::AlreadyExists { path: dst });
                    }
                }
                Entry::Vacant(vacant) => {
                    if let Some(file) = &moved {
                        vacant.insert(Arc::clone(file));
                    }
                }
            }
        }
        Ok(TwoPhaseMove {
            files: Arc::clone(self),
            src,
            dst,
            moved,
            settled: false,
        })
    }

    /// Flush and drop every open file. Channels left open keep working on
    /// their ciphertext files but are no longer tracked.
    pub fn close(&self) -> Result<(), CryptoFileError> {
        let paths: Vec<PathBuf> = self.files.iter().map(|entry| entry.key().clone()).collect();
        let mut first_error = None;
        for path in paths {
            if let Some((_, file)) = self.files.remove(&path) {
                file.force_close();
                if let Err(e) = file.write_errors().throw_if_present() {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Remove the entry for `file` unless the path was reused by a newer
    /// instance.
    pub(crate) fn remove_if_same(&self, file: &Arc<OpenCryptoFile>) {
        if let Some(path) = file.current_file_path() {
            self.files
                .remove_if(&path, |_, value| Arc::ptr_eq(value, file));
        }
    }
}

/// In-flight move of an open file between ciphertext paths.
///
/// Between `prepare_move` and `commit`, both paths map to the moved file,
/// so concurrent opens under either path join the same instance.
#[must_use = "a prepared move must be committed or rolled back"]
pub struct TwoPhaseMove {
    files: Arc<OpenCryptoFiles>,
    src: PathBuf,
    dst: PathBuf,
    moved: Option<Arc<OpenCryptoFile>>,
    settled: bool,
}

impl TwoPhaseMove {
    /// Second phase: the physical move succeeded, re-key the file to the
    /// destination path.
    pub fn commit(mut self) {
        if let Some(file) = &self.moved {
            file.update_current_file_path(self.dst.clone());
            if self.src != self.dst {
                self.files
                    .files
                    .remove_if(&self.src, |_, value| Arc::ptr_eq(value, file));
            }
            if file.current_file_path().is_none() {
                // Deleted while the move was in flight: no path maps to
                // this file anymore, so the dst alias must not outlive it.
                self.files
                    .files
                    .remove_if(&self.dst, |_, value| Arc::ptr_eq(value, file));
            }
        }
        self.settled = true;
    }

    /// Undo the reservation; the file stays at its source path.
    pub fn rollback(mut self) {
        self.settled = true;
        self.undo();
    }

    fn undo(&self) {
        if let Some(file) = &self.moved {
            if self.src != self.dst {
                self.files
                    .files
                    .remove_if(&self.dst, |_, value| Arc::ptr_eq(value, file));
            }
            if file.current_file_path().is_none() {
                // Deleted mid-move; the src mapping is dead as well.
                self.files
                    .files
                    .remove_if(&self.src, |_, value| Arc::ptr_eq(value, file));
            }
        }
    }
}

impl Drop for TwoPhaseMove {
    fn drop(&mut self) {
        if !self.settled {
            self.undo();
        }
    }
}
