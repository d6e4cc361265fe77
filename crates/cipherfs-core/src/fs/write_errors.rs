//! Deferred write-back error collection.
//!
//! Chunk write-back happens on whichever thread triggers an eviction, and
//! failing there would surface the error to an unrelated caller. Failures
//! are collected here instead and re-surfaced as one aggregate error at the
//! next explicit flush or close.

use std::sync::Mutex;

use tracing::warn;

use crate::error::CryptoFileError;

/// Collector for chunk write-back failures.
#[derive(Debug, Default)]
pub struct WriteBackErrors {
    errors: Mutex<Vec<CryptoFileError>>,
}

impl WriteBackErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write-back failure. Called by evicting threads.
    pub fn add(&self, error: CryptoFileError) {
        warn!(error = %error, "chunk write-back failed, deferring error to next flush");
        self.errors.lock().unwrap().push(error);
    }

    /// Surface all collected failures as one aggregate error, consuming the
    /// list. A no-op when nothing failed since the last call.
    pub fn throw_if_present(&self) -> Result<(), CryptoFileError> {
        let causes: Vec<CryptoFileError> = std::mem::take(&mut *self.errors.lock().unwrap());
        if causes.is_empty() {
            Ok(())
        } else {
            Err(CryptoFileError::DeferredWriteBack {
                count: causes.len(),
                causes,
            })
        }
    }
}
