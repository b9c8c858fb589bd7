//! 順序付きKey-Valueエンジン
//!
//! メタデータストアの土台となる、バイト列キーで辞書順に並ぶKVエンジン。
//! RocksDB風のマージオペレータフックを持ち、キーごとに積まれたオペランド
//! チェーンをエンジン側が単一スレッドで基底値に畳み込む。呼び出し側は
//! read-modify-writeをせずにオペランドを積むだけでよい。

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

/// KVエンジンエラー
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Key not found")]
    NotFound,

    #[error("Merge failed: {0}")]
    MergeFailed(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// マージオペレータフック
///
/// エンジンがオペランドチェーンを畳み込むときに呼び出す。実装側が
/// オペランドのエンコーディングと畳み込み規則を所有する。
pub trait MergeOperator: Send + Sync {
    /// 基底値とオペランド列 (投入順) から新しい完全値を計算する。
    /// `None` を返した場合はマージ失敗として扱われる。
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>>;
}

/// 1キー分のエントリ: 最後の完全値と未畳み込みのオペランドチェーン
#[derive(Debug, Default, Clone)]
struct Entry {
    base: Option<Vec<u8>>,
    operands: Vec<Vec<u8>>,
}

impl Entry {
    fn has_pending(&self) -> bool {
        !self.operands.is_empty()
    }
}

/// バッチ書き込みの1操作
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// 順序付きインメモリKVエンジン
///
/// BTreeMapベースで、キーは辞書順に並ぶ (プレフィックス範囲スキャン用)。
/// マップ全体をRwLockで保護する。オペランドの積み込みはロック下で投入順に
/// 直列化され、畳み込み (reconcile) もロック下で単一スレッド的に走るため、
/// キーごとのマージ順序は呼び出し側のロックなしで保証される。
pub struct KvEngine {
    map: RwLock<BTreeMap<Vec<u8>, Entry>>,
    merge_operator: Arc<dyn MergeOperator>,
}

impl KvEngine {
    pub fn new(merge_operator: Arc<dyn MergeOperator>) -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            merge_operator,
        }
    }

    /// 完全値を書き込む。未畳み込みのオペランドは破棄される。
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut map = self.map.write().expect("kv map poisoned");
        map.insert(
            key.to_vec(),
            Entry {
                base: Some(value.to_vec()),
                operands: Vec::new(),
            },
        );
    }

    /// マージオペランドを積む。キーが未作成でもチェーンは開始できる
    /// (create-after-delete レース対応)。
    pub fn merge(&self, key: &[u8], operand: Vec<u8>) {
        let mut map = self.map.write().expect("kv map poisoned");
        map.entry(key.to_vec()).or_default().operands.push(operand);
    }

    /// オペランドを積み、同一クリティカルセクション内で畳み込んだ
    /// 完全値を返す。appendサイズ更新のように「このオペランド適用直後の
    /// 値」が必要な呼び出し向け。
    pub fn merge_and_get(&self, key: &[u8], operand: Vec<u8>) -> KvResult<Vec<u8>> {
        let mut map = self.map.write().expect("kv map poisoned");
        let entry = map.entry(key.to_vec()).or_default();
        entry.operands.push(operand);
        match Self::reconcile(&self.merge_operator, key, entry) {
            Ok(()) => entry.base.clone().ok_or(KvError::NotFound),
            Err(e) => {
                // 失敗したオペランドはチェーンに残さない。このキーが
                // この呼び出しで初めて現れたのなら痕跡ごと消す。
                entry.operands.pop();
                let vacant = entry.base.is_none() && entry.operands.is_empty();
                if vacant {
                    map.remove(key);
                }
                Err(e)
            }
        }
    }

    /// 値を取得する。保留中のオペランドチェーンがあればここで畳み込む。
    pub fn get(&self, key: &[u8]) -> KvResult<Vec<u8>> {
        let mut map = self.map.write().expect("kv map poisoned");
        let entry = map.get_mut(key).ok_or(KvError::NotFound)?;
        if entry.has_pending() {
            Self::reconcile(&self.merge_operator, key, entry)?;
        }
        entry.base.clone().ok_or(KvError::NotFound)
    }

    /// キーを削除する。保留チェーンごと破棄する。
    pub fn delete(&self, key: &[u8]) -> KvResult<()> {
        let mut map = self.map.write().expect("kv map poisoned");
        map.remove(key).map(|_| ()).ok_or(KvError::NotFound)
    }

    /// キーの存在確認。畳み込みは行わない (チェーンのみのキーも存在扱い)。
    pub fn exists(&self, key: &[u8]) -> bool {
        let map = self.map.read().expect("kv map poisoned");
        map.contains_key(key)
    }

    /// バッチを単一クリティカルセクションで適用する (rename用の
    /// delete+insert など)。
    pub fn write_batch(&self, ops: Vec<BatchOp>) {
        let mut map = self.map.write().expect("kv map poisoned");
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(
                        key,
                        Entry {
                            base: Some(value),
                            operands: Vec::new(),
                        },
                    );
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
    }

    /// プレフィックス範囲スキャン。キー昇順で (key, value) を返す。
    /// 途中で畳み込みが必要なエントリは畳み込んでから返す。
    pub fn scan_prefix(&self, prefix: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut map = self.map.write().expect("kv map poisoned");
        let keys: Vec<Vec<u8>> = map
            .range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = map.get_mut(&key).expect("key vanished under write lock");
            if entry.has_pending() {
                Self::reconcile(&self.merge_operator, &key, entry)?;
            }
            if let Some(value) = &entry.base {
                out.push((key, value.clone()));
            }
        }
        Ok(out)
    }

    /// 登録キー数 (テスト・統計用)
    pub fn len(&self) -> usize {
        self.map.read().expect("kv map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reconcile(
        merge_operator: &Arc<dyn MergeOperator>,
        key: &[u8],
        entry: &mut Entry,
    ) -> KvResult<()> {
        if entry.operands.is_empty() {
            return Ok(());
        }
        let merged = merge_operator
            .full_merge(key, entry.base.as_deref(), &entry.operands)
            .ok_or_else(|| {
                KvError::MergeFailed(format!(
                    "merge operator rejected {} operand(s)",
                    entry.operands.len()
                ))
            })?;
        entry.base = Some(merged);
        entry.operands.clear();
        Ok(())
    }
}
