//! Random-access I/O on encrypted files.

pub mod buffer_pool;
pub mod channel;
pub mod chunk;
pub mod chunk_cache;
pub mod chunk_io;
pub mod header_holder;
pub mod open_file;
pub mod open_files;
pub mod priority_lock;
pub mod write_errors;

// Re-export commonly used types
pub use channel::CleartextFileChannel;
pub use chunk::{Chunk, SharedChunk};
pub use chunk_cache::{ChunkCache, MAX_CACHED_CHUNKS};
pub use chunk_io::{ChunkIo, CiphertextChannel};
pub use header_holder::FileHeaderHolder;
pub use open_file::{OpenCryptoFile, OpenOptions};
pub use open_files::{OpenCryptoFiles, TwoPhaseMove};
pub use priority_lock::{PriorityMutex, PriorityMutexToken};
pub use write_errors::WriteBackErrors;
