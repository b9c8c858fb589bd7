//! ノードローカルストレージ層

pub mod chunk_storage;
pub mod error;

pub use chunk_storage::{ChunkStat, ChunkStorage};
pub use error::{ChunkStorageError, ChunkStorageResult};
