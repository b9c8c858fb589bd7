//! 型付きリクエスト/レスポンスとワイヤエラーコード
//!
//! ピア間でやり取りされる操作の全集合。メタデータ値はシリアライズ済み
//! テキストのまま運び、構造体への復元は受信側で行う。

use crate::metadata::store::DirEntry;
use crate::metadata::uid::UidError;
use crate::metadata::{MetadataError, MetadataFormatError};
use crate::storage::{ChunkStat, ChunkStorageError};

/// ワイヤレベルのエラーコード
///
/// リモート障害の分類。ローカルのエラー型はピア境界を越えるときに
/// このコードへ潰され、詳細はピア側のログにだけ残る。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Exists,
    InvalidArgument,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    Unsupported,
    ResourceExhausted,
    Io,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::Exists => "already exists",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::NotADirectory => "not a directory",
            ErrorCode::IsADirectory => "is a directory",
            ErrorCode::DirectoryNotEmpty => "directory not empty",
            ErrorCode::Unsupported => "unsupported operation",
            ErrorCode::ResourceExhausted => "resource exhausted",
            ErrorCode::Io => "I/O error",
        };
        f.write_str(name)
    }
}

impl From<MetadataError> for ErrorCode {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::NotFound => ErrorCode::NotFound,
            MetadataError::Exists => ErrorCode::Exists,
            MetadataError::NotADirectory => ErrorCode::NotADirectory,
            MetadataError::Format(_) => ErrorCode::InvalidArgument,
            MetadataError::Kv(_) => ErrorCode::Io,
        }
    }
}

impl From<MetadataFormatError> for ErrorCode {
    fn from(_: MetadataFormatError) -> Self {
        ErrorCode::InvalidArgument
    }
}

impl From<ChunkStorageError> for ErrorCode {
    fn from(e: ChunkStorageError) -> Self {
        match e {
            ChunkStorageError::OutOfBounds { .. } | ChunkStorageError::ZeroChunkSize => {
                ErrorCode::InvalidArgument
            }
            ChunkStorageError::Io { .. } | ChunkStorageError::Stat { .. } => ErrorCode::Io,
        }
    }
}

impl From<UidError> for ErrorCode {
    fn from(e: UidError) -> Self {
        match e {
            UidError::Overflow => ErrorCode::ResourceExhausted,
            UidError::ZeroSlots | UidError::SlotOutOfRange { .. } => ErrorCode::InvalidArgument,
        }
    }
}

/// ピアへのリクエスト
///
/// チャンク範囲系のリクエストは操作全体のジオメトリ
/// (chunk_start..=chunk_end, 先頭チャンク内オフセット, 総スパン) を
/// そのまま運ぶ。受信ピアは自分のディストリビュータで所有チャンクを
/// 再導出するので、クライアントがチャンクIDのリストを列挙して送る
/// 必要はない。
#[derive(Debug, Clone)]
pub enum Request {
    Create {
        key: String,
        metadata: String,
    },
    Remove {
        key: String,
    },
    GetAttributes {
        key: String,
    },
    UpdateAttributes {
        old_key: String,
        new_key: String,
        metadata: String,
    },
    GetSize {
        key: String,
    },
    /// サイズ増加。appendの場合sizeは追記長、そうでなければ到達境界。
    UpdateSize {
        key: String,
        size: u64,
        append: bool,
    },
    /// サイズ切り下げ (truncateのメタデータ側)
    DecreaseSize {
        key: String,
        size: u64,
    },
    ListDirectory {
        dir: String,
    },
    WriteChunkRange {
        identity: String,
        chunk_start: u64,
        chunk_end: u64,
        offset: u64,
        total_size: u64,
        data: Vec<u8>,
    },
    ReadChunkRange {
        identity: String,
        chunk_start: u64,
        chunk_end: u64,
        offset: u64,
        total_size: u64,
    },
    /// truncateのデータ側。受信ピアが境界チャンクの切り詰めと
    /// 以降のトリムを自分の所有分について行う。
    TruncateChunkRange {
        identity: String,
        new_size: u64,
    },
    /// オブジェクトの全ローカルチャンクを破棄する (remove用)
    DestroyChunkSpace {
        identity: String,
    },
    ChunkStat,
}

/// 読み出しレスポンス内の1チャンク分のデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSegment {
    pub chunk_index: u64,
    pub data: Vec<u8>,
}

/// ピアからのレスポンス
#[derive(Debug, Clone)]
pub enum Response {
    Ack,
    /// create成功。データアドレッシングに使う識別文字列を返す。
    Created { identity: String },
    Attributes { metadata: String },
    Size { size: u64 },
    Dirents { entries: Vec<DirEntry> },
    Written { bytes: u64 },
    Read { segments: Vec<ChunkSegment> },
    Stat { stat: ChunkStat },
}
