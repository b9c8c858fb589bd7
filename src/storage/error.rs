//! チャンクストレージのエラー型

#[derive(Debug, thiserror::Error)]
pub enum ChunkStorageError {
    #[error("Chunk I/O failed at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Byte range out of chunk bounds: offset {offset} + length {length} > chunk size {chunk_size}"
    )]
    OutOfBounds {
        offset: u64,
        length: u64,
        chunk_size: u64,
    },

    #[error("Chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("Filesystem stat failed at {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ChunkStorageResult<T> = Result<T, ChunkStorageError>;
