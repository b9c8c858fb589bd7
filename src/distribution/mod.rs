//! チャンク・メタデータ配置ポリシー
//!
//! どのピアがどのチャンク/メタデータを所有するかを決める純粋な計算。
//! クライアントとデーモンが同一設定で同一の答えを出すことが分散配置の
//! 前提になるため、ポリシーは閉じたenumで、全バリアントが決定的。

use std::collections::HashMap;

use xxhash_rust::xxh64::xxh64;

/// デプロイメント内のピア番号 (0始まり、全ピアで共有される並び)
pub type PeerIndex = usize;

/// 配置ポリシー
#[derive(Debug, Clone)]
pub enum Distributor {
    /// `"{identity}:{chunk_index}"` のxxh64をピア数で還元する標準ポリシー
    SimpleHash {
        localhost: PeerIndex,
        peer_count: usize,
    },
    /// 常に自ピアを答える (単一ノード構成・テスト用)
    LocalOnly { localhost: PeerIndex },
    /// 明示的なピン留めテーブル。ヒットしなければfallbackに委譲する。
    Override {
        table: HashMap<(String, u64), PeerIndex>,
        fallback: Box<Distributor>,
    },
}

impl Distributor {
    pub fn localhost(&self) -> PeerIndex {
        match self {
            Distributor::SimpleHash { localhost, .. } => *localhost,
            Distributor::LocalOnly { localhost } => *localhost,
            Distributor::Override { fallback, .. } => fallback.localhost(),
        }
    }

    pub fn peer_count(&self) -> usize {
        match self {
            Distributor::SimpleHash { peer_count, .. } => *peer_count,
            Distributor::LocalOnly { .. } => 1,
            Distributor::Override { fallback, .. } => fallback.peer_count(),
        }
    }

    /// チャンクの所有ピアを返す。
    pub fn locate_data(&self, identity: &str, chunk_index: u64) -> PeerIndex {
        match self {
            Distributor::SimpleHash { peer_count, .. } => {
                let token = format!("{}:{}", identity, chunk_index);
                (xxh64(token.as_bytes(), 0) % *peer_count as u64) as PeerIndex
            }
            Distributor::LocalOnly { localhost } => *localhost,
            Distributor::Override { table, fallback } => table
                .get(&(identity.to_string(), chunk_index))
                .copied()
                .unwrap_or_else(|| fallback.locate_data(identity, chunk_index)),
        }
    }

    /// メタデータエントリの所有ピアを返す。
    pub fn locate_metadata(&self, identity: &str) -> PeerIndex {
        match self {
            Distributor::SimpleHash { peer_count, .. } => {
                (xxh64(identity.as_bytes(), 0) % *peer_count as u64) as PeerIndex
            }
            Distributor::LocalOnly { localhost } => *localhost,
            Distributor::Override { fallback, .. } => fallback.locate_metadata(identity),
        }
    }

    /// ディレクトリエントリが分散しうる全ピア。リスティングは全ピアへの
    /// ファンアウトになる。
    pub fn locate_directory_fanout(&self, _dir: &str) -> Vec<PeerIndex> {
        (0..self.peer_count()).collect()
    }
}
