//! KVエンジン上のメタデータストア
//!
//! キーはオブジェクトの識別文字列 (パスまたは割り当てuid)、値は
//! シリアライズ済みMetadata。サイズ会計はすべてマージオペランド経由で、
//! read-modify-writeもノード全体のロックも使わない。

use std::sync::Arc;

use crate::kv::{BatchOp, KvEngine, KvError};
use crate::metadata::merge::{MergeOperand, MetadataMergeOperator};
use crate::metadata::types::{Metadata, MetadataFormatError};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Metadata entry not found")]
    NotFound,

    #[error("Metadata entry already exists")]
    Exists,

    #[error("Not a directory")]
    NotADirectory,

    #[error("Metadata format error: {0}")]
    Format(#[from] MetadataFormatError),

    #[error("KV engine error: {0}")]
    Kv(KvError),
}

impl From<KvError> for MetadataError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::NotFound => MetadataError::NotFound,
            other => MetadataError::Kv(other),
        }
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// ディレクトリリスティングの1エントリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// メタデータストア
///
/// エンジンはキーごとのオペランド投入順を保存し、畳み込みを単一スレッド
/// 的に実行するので、複数RPCハンドラスレッドから同時に呼んでも
/// サイズ会計は正しく合成される。
pub struct MetadataStore {
    kv: KvEngine,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            kv: KvEngine::new(Arc::new(MetadataMergeOperator)),
        }
    }

    /// エントリを新規作成する。既存キーはエラー。
    ///
    /// 値の設置はcreateオペランドで行う。直前にdeleteされた同一キーの
    /// 保留チェーンが残っていても、チェーン途中のcreateとして正しく
    /// 合成される。
    pub fn create(&self, key: &str, metadata: &Metadata) -> MetadataResult<()> {
        if self.kv.exists(key.as_bytes()) {
            return Err(MetadataError::Exists);
        }
        let operand = MergeOperand::Create {
            value: metadata.serialize()?.into_bytes(),
        };
        self.kv.merge(key.as_bytes(), operand.encode());
        tracing::debug!(key, "Created metadata entry");
        Ok(())
    }

    pub fn get(&self, key: &str) -> MetadataResult<Metadata> {
        let value = self.kv.get(key.as_bytes())?;
        let text = std::str::from_utf8(&value)
            .map_err(|_| MetadataFormatError::Malformed("non-utf8 value".to_string()))?;
        Ok(Metadata::deserialize(text)?)
    }

    /// rename用: 旧キーの削除と新キーへの設置を単一バッチで適用する。
    pub fn update(&self, old_key: &str, new_key: &str, metadata: &Metadata) -> MetadataResult<()> {
        if !self.kv.exists(old_key.as_bytes()) {
            return Err(MetadataError::NotFound);
        }
        let value = metadata.serialize()?.into_bytes();
        self.kv.write_batch(vec![
            BatchOp::Delete {
                key: old_key.as_bytes().to_vec(),
            },
            BatchOp::Put {
                key: new_key.as_bytes().to_vec(),
                value,
            },
        ]);
        tracing::debug!(old_key, new_key, "Renamed metadata entry");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> MetadataResult<()> {
        self.kv.delete(key.as_bytes())?;
        tracing::debug!(key, "Removed metadata entry");
        Ok(())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.kv.exists(key.as_bytes())
    }

    /// サイズ増加オペランドを積み、このオペランド適用直後のサイズを返す。
    ///
    /// appendの場合 `size_or_bound` は追記長で、返り値から追記長を引いた
    /// ものが呼び出し側の書き込み開始オフセットになる。非appendの場合は
    /// `offset + length` の到達境界で、サイズは `max` でしか動かない。
    pub fn increase_size(&self, key: &str, size_or_bound: u64, append: bool) -> MetadataResult<u64> {
        if !self.kv.exists(key.as_bytes()) {
            return Err(MetadataError::NotFound);
        }
        let operand = MergeOperand::IncreaseSize {
            size: size_or_bound,
            append,
        };
        let value = self.kv.merge_and_get(key.as_bytes(), operand.encode())?;
        let text = std::str::from_utf8(&value)
            .map_err(|_| MetadataFormatError::Malformed("non-utf8 value".to_string()))?;
        Ok(Metadata::deserialize(text)?.size)
    }

    /// サイズをnew_sizeまで切り下げるオペランドを積む (truncate用)。
    pub fn decrease_size(&self, key: &str, new_size: u64) -> MetadataResult<()> {
        if !self.kv.exists(key.as_bytes()) {
            return Err(MetadataError::NotFound);
        }
        let operand = MergeOperand::DecreaseSize { size: new_size };
        // 畳み込み結果は不要だが、存在しないキーへのtruncateを
        // その場でエラーにするため同期畳み込み版を使う
        self.kv.merge_and_get(key.as_bytes(), operand.encode())?;
        Ok(())
    }

    pub fn get_size(&self, key: &str) -> MetadataResult<u64> {
        Ok(self.get(key)?.size)
    }

    /// ディレクトリ直下のエントリを辞書順で返す。
    ///
    /// パスアドレッシング前提の操作。プレフィックス範囲スキャンで
    /// `<dir>/` 配下を集め、さらに `/` を含む孫以降のキーを除外する。
    pub fn get_dirents(&self, dir: &str) -> MetadataResult<Vec<DirEntry>> {
        if dir != "/" && !self.get(dir)?.is_directory() {
            return Err(MetadataError::NotADirectory);
        }
        self.scan_dirents(dir)
    }

    /// get_direntsの検査なし版。ディレクトリ自体のメタデータを持たない
    /// ピアがファンアウトに応答するときに使う。
    pub fn scan_dirents(&self, dir: &str) -> MetadataResult<Vec<DirEntry>> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{}/", dir)
        };

        let mut entries = Vec::new();
        for (key, value) in self.kv.scan_prefix(prefix.as_bytes())? {
            let key = std::str::from_utf8(&key)
                .map_err(|_| MetadataFormatError::Malformed("non-utf8 key".to_string()))?;
            let name = &key[prefix.len()..];
            if name.is_empty() || name.contains('/') {
                continue;
            }
            let text = std::str::from_utf8(&value)
                .map_err(|_| MetadataFormatError::Malformed("non-utf8 value".to_string()))?;
            let metadata = Metadata::deserialize(text)?;
            entries.push(DirEntry {
                name: name.to_string(),
                is_directory: metadata.is_directory(),
            });
        }
        Ok(entries)
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_file(key: &str, size: u64) -> MetadataStore {
        let store = MetadataStore::new();
        let mut m = Metadata::new_regular(0o644);
        m.size = size;
        store.create(key, &m).unwrap();
        store
    }

    #[test]
    fn test_create_then_get() {
        let store = store_with_file("/f", 10);
        let m = store.get("/f").unwrap();
        assert_eq!(m.size, 10);
        assert!(m.is_regular());
    }

    #[test]
    fn test_create_existing_fails() {
        let store = store_with_file("/f", 0);
        let m = Metadata::new_regular(0o644);
        assert!(matches!(store.create("/f", &m), Err(MetadataError::Exists)));
    }

    #[test]
    fn test_remove_then_get_not_found() {
        let store = store_with_file("/f", 0);
        store.remove("/f").unwrap();
        assert!(matches!(store.get("/f"), Err(MetadataError::NotFound)));
        assert!(!store.exists("/f"));
    }

    #[test]
    fn test_create_after_remove_composes() {
        let store = store_with_file("/f", 10);
        store.remove("/f").unwrap();
        let m = Metadata::new_regular(0o600);
        store.create("/f", &m).unwrap();
        assert_eq!(store.get_size("/f").unwrap(), 0);
    }

    #[test]
    fn test_update_moves_entry_atomically() {
        let store = store_with_file("/old", 5);
        let m = store.get("/old").unwrap();
        store.update("/old", "/new", &m).unwrap();
        assert!(!store.exists("/old"));
        assert_eq!(store.get_size("/new").unwrap(), 5);
    }

    #[test]
    fn test_update_missing_source_fails() {
        let store = MetadataStore::new();
        let m = Metadata::new_regular(0o644);
        assert!(matches!(
            store.update("/nope", "/new", &m),
            Err(MetadataError::NotFound)
        ));
    }

    #[test]
    fn test_increase_size_non_append_high_water() {
        let store = store_with_file("/f", 100);
        assert_eq!(store.increase_size("/f", 50, false).unwrap(), 100);
        assert_eq!(store.increase_size("/f", 180, false).unwrap(), 180);
    }

    #[test]
    fn test_increase_size_append_returns_post_operand_size() {
        let store = store_with_file("/f", 0);
        // 2回の5バイト追記: それぞれが自分のオペランド直後のサイズを
        // 受け取るので、開始オフセットは 0 と 5 に一意に決まる
        let first = store.increase_size("/f", 5, true).unwrap();
        let second = store.increase_size("/f", 5, true).unwrap();
        assert_eq!(first, 5);
        assert_eq!(second, 10);
        assert_eq!(store.get_size("/f").unwrap(), 10);
    }

    #[test]
    fn test_decrease_size_clamps() {
        let store = store_with_file("/f", 10);
        store.decrease_size("/f", 3).unwrap();
        assert_eq!(store.get_size("/f").unwrap(), 3);

        // 拡張方向には動かない
        store.decrease_size("/f", 100).unwrap();
        assert_eq!(store.get_size("/f").unwrap(), 3);
    }

    #[test]
    fn test_size_update_on_missing_key_fails() {
        let store = MetadataStore::new();
        assert!(matches!(
            store.increase_size("/nope", 1, true),
            Err(MetadataError::NotFound)
        ));
        assert!(matches!(
            store.decrease_size("/nope", 0),
            Err(MetadataError::NotFound)
        ));
        // 失敗したサイズ更新がキーの痕跡を残さない
        assert!(!store.exists("/nope"));
    }

    #[test]
    fn test_dirents_direct_children_only() {
        let store = MetadataStore::new();
        store.create("/d", &Metadata::new_directory(0o755)).unwrap();
        store
            .create("/d/a", &Metadata::new_regular(0o644))
            .unwrap();
        store
            .create("/d/sub", &Metadata::new_directory(0o755))
            .unwrap();
        store
            .create("/d/sub/nested", &Metadata::new_regular(0o644))
            .unwrap();
        store
            .create("/dz", &Metadata::new_regular(0o644))
            .unwrap();

        let entries = store.get_dirents("/d").unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "a".to_string(),
                    is_directory: false
                },
                DirEntry {
                    name: "sub".to_string(),
                    is_directory: true
                },
            ]
        );
    }

    #[test]
    fn test_dirents_root() {
        let store = MetadataStore::new();
        store.create("/a", &Metadata::new_regular(0o644)).unwrap();
        store.create("/b", &Metadata::new_directory(0o755)).unwrap();
        store.create("/b/c", &Metadata::new_regular(0o644)).unwrap();

        let names: Vec<_> = store
            .get_dirents("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_dirents_on_regular_file_fails() {
        let store = store_with_file("/f", 0);
        assert!(matches!(
            store.get_dirents("/f"),
            Err(MetadataError::NotADirectory)
        ));
    }

    #[test]
    fn test_concurrent_appends_disjoint_offsets() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let store = Arc::new(store_with_file("/f", 0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut offsets = Vec::new();
                for _ in 0..50 {
                    let new_size = store.increase_size("/f", 4, true).unwrap();
                    offsets.push(new_size - 4);
                }
                offsets
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for off in h.join().unwrap() {
                // 各追記が互いに素な4バイト領域を得る
                assert!(seen.insert(off), "duplicate offset {}", off);
                assert_eq!(off % 4, 0);
            }
        }
        assert_eq!(store.get_size("/f").unwrap(), 8 * 50 * 4);
    }
}
