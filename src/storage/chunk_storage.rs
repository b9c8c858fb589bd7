//! ノードローカルのチャンクストレージエンジン
//!
//! 1オブジェクトにつき1ディレクトリ (名前は識別文字列のxxh64十六進)、
//! 1チャンクにつき1ファイル。ファイルはスパースに作られ、書かれていない
//! 範囲のゼロ埋めはしない。チャンクファイルが互いに独立なので、別チャンク
//! への並行書き込みは干渉しない。

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh64::xxh64;

use crate::storage::error::{ChunkStorageError, ChunkStorageResult};

const CHUNK_DIR: &str = "chunks";

/// ファイルシステム容量のチャンク換算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStat {
    pub chunk_size: u64,
    pub chunk_total: u64,
    pub chunk_free: u64,
}

pub struct ChunkStorage {
    root: PathBuf,
    chunk_size: u64,
}

impl ChunkStorage {
    pub fn new(root: impl Into<PathBuf>, chunk_size: u64) -> ChunkStorageResult<Self> {
        if chunk_size == 0 {
            return Err(ChunkStorageError::ZeroChunkSize);
        }
        let root = root.into().join(CHUNK_DIR);
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root, chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn object_dir(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{:016x}", xxh64(identity.as_bytes(), 0)))
    }

    fn chunk_path(&self, identity: &str, chunk_index: u64) -> PathBuf {
        self.object_dir(identity).join(chunk_index.to_string())
    }

    fn check_bounds(&self, offset: u64, length: u64) -> ChunkStorageResult<()> {
        if offset
            .checked_add(length)
            .map_or(true, |end| end > self.chunk_size)
        {
            return Err(ChunkStorageError::OutOfBounds {
                offset,
                length,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }

    /// チャンク内バイト範囲を書き込む。オブジェクトディレクトリと
    /// チャンクファイルは初回書き込みで遅延作成される。
    pub fn write_chunk(
        &self,
        identity: &str,
        chunk_index: u64,
        data: &[u8],
        offset: u64,
    ) -> ChunkStorageResult<u64> {
        self.check_bounds(offset, data.len() as u64)?;
        let dir = self.object_dir(identity);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let path = self.chunk_path(identity, chunk_index);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.write_all_at(data, offset).map_err(|e| io_err(&path, e))?;
        tracing::trace!(
            identity,
            chunk_index,
            offset,
            length = data.len(),
            "Wrote chunk range"
        );
        Ok(data.len() as u64)
    }

    /// チャンク内バイト範囲を読む。書かれた範囲を超える部分は読まれず、
    /// 実際に読めたバイト数を返す。チャンクファイル自体が存在しなければ
    /// エラーではなく0バイト。
    pub fn read_chunk(
        &self,
        identity: &str,
        chunk_index: u64,
        buf: &mut [u8],
        offset: u64,
    ) -> ChunkStorageResult<u64> {
        self.check_bounds(offset, buf.len() as u64)?;
        let path = self.chunk_path(identity, chunk_index);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(&path, e)),
        };

        let mut read = 0usize;
        while read < buf.len() {
            match file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_err(&path, e)),
            }
        }
        Ok(read as u64)
    }

    /// `[chunk_start, chunk_end]` のチャンクファイルを削除する。
    /// 存在しないチャンクは黙って飛ばす。
    pub fn trim_chunk_space(
        &self,
        identity: &str,
        chunk_start: u64,
        chunk_end: u64,
    ) -> ChunkStorageResult<()> {
        let dir = self.object_dir(identity);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            if (chunk_start..=chunk_end).contains(&index) {
                let path = entry.path();
                fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            }
        }
        Ok(())
    }

    /// 境界チャンクを指定長に切り詰める。スパース運用なので、まだ実体の
    /// ないチャンクはその長さで作られる。
    pub fn truncate_chunk(
        &self,
        identity: &str,
        chunk_index: u64,
        length: u64,
    ) -> ChunkStorageResult<()> {
        self.check_bounds(0, length)?;
        let dir = self.object_dir(identity);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = self.chunk_path(identity, chunk_index);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.set_len(length).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// オブジェクトの全チャンクを破棄する。未作成なら何もしない。
    pub fn destroy_chunk_space(&self, identity: &str) -> ChunkStorageResult<()> {
        let dir = self.object_dir(identity);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, e)),
        }
    }

    /// ストレージルートのファイルシステム容量をチャンク数に換算して返す。
    pub fn chunk_stat(&self) -> ChunkStorageResult<ChunkStat> {
        let stat = statvfs(&self.root)?;
        let bytes_total = stat.f_frsize as u64 * stat.f_blocks as u64;
        let bytes_free = stat.f_frsize as u64 * stat.f_bavail as u64;
        Ok(ChunkStat {
            chunk_size: self.chunk_size,
            chunk_total: bytes_total / self.chunk_size,
            chunk_free: bytes_free / self.chunk_size,
        })
    }
}

fn io_err(path: &Path, source: std::io::Error) -> ChunkStorageError {
    ChunkStorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn statvfs(path: &Path) -> ChunkStorageResult<libc::statvfs> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ChunkStorageError::Stat {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul byte in path"),
        }
    })?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(ChunkStorageError::Stat {
            path: path.display().to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(stat)
}
