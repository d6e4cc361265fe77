//! File content cryptography.
//!
//! Ciphertext files consist of a single encrypted header followed by
//! independently authenticated content chunks:
//!
//! - **Header (68 bytes)**: 12-byte nonce + 40-byte encrypted payload
//!   (8 reserved bytes + 32-byte content key) + 16-byte GCM tag, encrypted
//!   with the master key.
//! - **Content chunks (up to 32,796 bytes each)**: 12-byte nonce + ≤32 KiB
//!   ciphertext + 16-byte tag, encrypted with the per-file content key.
//!
//! Each chunk binds to its position via AAD: the chunk index (u64,
//! big-endian) concatenated with the header nonce. Reordering or
//! transplanting chunks between files therefore fails authentication.

use std::fmt;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

/// Size of the file header in bytes (nonce + encrypted payload + tag).
pub const HEADER_SIZE: usize = 68;

/// Size of the header nonce in bytes.
pub const HEADER_NONCE_SIZE: usize = 12;

/// Size of the chunk nonce in bytes.
pub const CHUNK_NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Maximum cleartext size per chunk (32 KiB).
pub const CLEARTEXT_CHUNK_SIZE: usize = 32768;

/// Overhead per chunk (nonce + tag).
pub const CHUNK_OVERHEAD: usize = CHUNK_NONCE_SIZE + TAG_SIZE;

/// Maximum ciphertext chunk size (nonce + ciphertext + tag).
pub const CIPHERTEXT_CHUNK_SIZE: usize = CLEARTEXT_CHUNK_SIZE + CHUNK_OVERHEAD;

/// Errors that can occur during header or chunk cryptography.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Header has an invalid structure (wrong length, bad payload size).
    #[error("invalid file header: {reason}")]
    InvalidHeader { reason: String },

    /// Header decryption failed - authentication tag verification failed.
    ///
    /// The header ciphertext is invalid or has been tampered with.
    #[error("header authentication failed - possible tampering or wrong key")]
    HeaderDecryption,

    /// Header encryption failed unexpectedly.
    #[error("header encryption failed: {reason}")]
    HeaderEncryption { reason: String },

    /// Chunk decryption failed - authentication tag verification failed.
    ///
    /// The chunk ciphertext is invalid, tampered with, or bound to a
    /// different index or header.
    #[error("chunk {index} authentication failed - possible tampering or wrong key")]
    ChunkDecryption { index: u64 },

    /// Chunk encryption failed unexpectedly.
    #[error("chunk {index} encryption failed: {reason}")]
    ChunkEncryption { index: u64, reason: String },

    /// Ciphertext chunk is too short to carry a nonce and tag.
    #[error("incomplete chunk {index}: expected at least {expected} bytes, got {actual}")]
    IncompleteChunk {
        index: u64,
        expected: usize,
        actual: usize,
    },
}

/// Decrypted file header: the per-file content key and the nonce binding
/// chunks to this file.
///
/// Created or loaded at most once per logical file; all chunk cryptography
/// for the file binds to this instance via the header nonce.
pub struct FileHeader {
    nonce: [u8; HEADER_NONCE_SIZE],
    content_key: Zeroizing<[u8; 32]>,
}

impl FileHeader {
    /// The header nonce, part of every chunk's AAD.
    pub fn nonce(&self) -> &[u8; HEADER_NONCE_SIZE] {
        &self.nonce
    }
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM cryptor for file headers and content chunks.
///
/// Holds the master key; header encryption uses it directly, chunk
/// encryption uses the per-file content key carried in the header.
pub struct Cryptor {
    master_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for Cryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cryptor")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl Cryptor {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self {
            master_key: Zeroizing::new(master_key),
        }
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    #[inline]
    pub fn cleartext_chunk_size(&self) -> usize {
        CLEARTEXT_CHUNK_SIZE
    }

    #[inline]
    pub fn ciphertext_chunk_size(&self) -> usize {
        CIPHERTEXT_CHUNK_SIZE
    }

    /// Generate a fresh header with a random nonce and content key.
    pub fn create_header(&self) -> FileHeader {
        let mut nonce = [0u8; HEADER_NONCE_SIZE];
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut nonce);
        rand::rng().fill_bytes(&mut *content_key);
        FileHeader { nonce, content_key }
    }

    /// Encrypt a header into its 68-byte on-disk form.
    ///
    /// Reuses the header's own nonce so chunk AAD bindings stay valid
    /// across re-encryption.
    pub fn encrypt_header(&self, header: &FileHeader) -> Result<Vec<u8>, CryptoError> {
        let key = Key::<Aes256Gcm>::from_slice(&*self.master_key);
        let cipher = Aes256Gcm::new(key);

        let mut payload = Zeroizing::new(vec![0xFF; 8]);
        payload.extend_from_slice(&*header.content_key);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&header.nonce), payload.as_slice())
            .map_err(|e| CryptoError::HeaderEncryption {
                reason: e.to_string(),
            })?;

        let mut encrypted = Vec::with_capacity(HEADER_SIZE);
        encrypted.extend_from_slice(&header.nonce);
        encrypted.extend_from_slice(&ciphertext);
        Ok(encrypted)
    }

    /// Decrypt a 68-byte on-disk header.
    pub fn decrypt_header(&self, encrypted: &[u8]) -> Result<FileHeader, CryptoError> {
        if encrypted.len() != HEADER_SIZE {
            return Err(CryptoError::InvalidHeader {
                reason: format!("expected {HEADER_SIZE} bytes, got {}", encrypted.len()),
            });
        }

        let mut nonce = [0u8; HEADER_NONCE_SIZE];
        nonce.copy_from_slice(&encrypted[..HEADER_NONCE_SIZE]);

        let key = Key::<Aes256Gcm>::from_slice(&*self.master_key);
        let cipher = Aes256Gcm::new(key);

        let decrypted = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                &encrypted[HEADER_NONCE_SIZE..],
            )
            .map_err(|_| CryptoError::HeaderDecryption)?;
        let decrypted = Zeroizing::new(decrypted);

        if decrypted.len() != 40 {
            return Err(CryptoError::InvalidHeader {
                reason: format!(
                    "decrypted payload has incorrect size: expected 40 bytes, got {}",
                    decrypted.len()
                ),
            });
        }

        // The first 8 bytes are reserved and not validated, for forward
        // compatibility.
        let mut content_key = Zeroizing::new([0u8; 32]);
        content_key.copy_from_slice(&decrypted[8..40]);

        Ok(FileHeader { nonce, content_key })
    }

    /// Encrypt one cleartext chunk, bound to its index and the file header.
    pub fn encrypt_chunk(
        &self,
        cleartext: &[u8],
        index: u64,
        header: &FileHeader,
    ) -> Result<Vec<u8>, CryptoError> {
        debug_assert!(cleartext.len() <= CLEARTEXT_CHUNK_SIZE);

        let mut chunk_nonce = [0u8; CHUNK_NONCE_SIZE];
        rand::rng().fill_bytes(&mut chunk_nonce);

        let aad = chunk_aad(index, &header.nonce);
        let key = Key::<Aes256Gcm>::from_slice(&*header.content_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&chunk_nonce),
                Payload {
                    msg: cleartext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::ChunkEncryption {
                index,
                reason: e.to_string(),
            })?;

        let mut encrypted = Vec::with_capacity(CHUNK_NONCE_SIZE + ciphertext.len());
        encrypted.extend_from_slice(&chunk_nonce);
        encrypted.extend_from_slice(&ciphertext);
        Ok(encrypted)
    }

    /// Decrypt and authenticate one ciphertext chunk against its index and
    /// the file header.
    pub fn decrypt_chunk(
        &self,
        ciphertext: &[u8],
        index: u64,
        header: &FileHeader,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() < CHUNK_OVERHEAD {
            return Err(CryptoError::IncompleteChunk {
                index,
                expected: CHUNK_OVERHEAD,
                actual: ciphertext.len(),
            });
        }

        let nonce = Nonce::from_slice(&ciphertext[..CHUNK_NONCE_SIZE]);
        let aad = chunk_aad(index, &header.nonce);
        let key = Key::<Aes256Gcm>::from_slice(&*header.content_key);
        let cipher = Aes256Gcm::new(key);

        let cleartext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext[CHUNK_NONCE_SIZE..],
                    aad: &aad,
                },
            )
            .map_err(|_| {
                warn!(chunk = index, "chunk decryption failed - authentication tag mismatch");
                CryptoError::ChunkDecryption { index }
            })?;

        Ok(Zeroizing::new(cleartext))
    }

    /// Calculate cleartext file size from the ciphertext payload size
    /// (ciphertext file length minus the header).
    ///
    /// Returns `None` if the payload size cannot result from any valid
    /// sequence of chunks.
    pub fn cleartext_size(&self, payload_size: u64) -> Option<u64> {
        let full_chunks = payload_size / CIPHERTEXT_CHUNK_SIZE as u64;
        let remainder = payload_size % CIPHERTEXT_CHUNK_SIZE as u64;

        let mut cleartext = full_chunks * CLEARTEXT_CHUNK_SIZE as u64;
        if remainder > 0 {
            if remainder < CHUNK_OVERHEAD as u64 {
                // Partial chunk too small to carry a nonce and tag.
                return None;
            }
            cleartext += remainder - CHUNK_OVERHEAD as u64;
        }
        Some(cleartext)
    }

    /// Calculate the exact ciphertext payload size for a cleartext size.
    pub fn ciphertext_size(&self, cleartext_size: u64) -> u64 {
        let full_chunks = cleartext_size / CLEARTEXT_CHUNK_SIZE as u64;
        let remainder = cleartext_size % CLEARTEXT_CHUNK_SIZE as u64;

        let mut ciphertext = full_chunks * CIPHERTEXT_CHUNK_SIZE as u64;
        if remainder > 0 {
            ciphertext += remainder + CHUNK_OVERHEAD as u64;
        }
        ciphertext
    }
}

/// Build chunk AAD: chunk index (8 bytes BE) || header nonce (12 bytes).
#[inline]
fn chunk_aad(index: u64, header_nonce: &[u8; HEADER_NONCE_SIZE]) -> [u8; 8 + HEADER_NONCE_SIZE] {
    let mut aad = [0u8; 8 + HEADER_NONCE_SIZE];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8..].copy_from_slice(header_nonce);
    aad
}
