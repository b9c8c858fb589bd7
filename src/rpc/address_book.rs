//! ピアインデックスからエンドポイントへの解決と再送ポリシー
//!
//! デプロイメント共有のピア並び (設定のnetwork.peers) をそのまま
//! エンドポイント表として持つ。再送間隔は有界の指数バックオフに
//! ハッシュ由来のジッタを足したもので、同時に失敗した多数の
//! クライアントが同じ拍で再送し続けるのを避ける。

use std::time::Duration;

use xxhash_rust::xxh64::xxh64;

use crate::config::NetworkConfig;
use crate::distribution::PeerIndex;
use crate::rpc::error::{RpcError, RpcResult};

pub struct AddressBook {
    endpoints: Vec<String>,
    max_retries: u32,
    backoff_ms: u64,
}

impl AddressBook {
    pub fn new(endpoints: Vec<String>, max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            endpoints,
            max_retries,
            backoff_ms,
        }
    }

    /// 設定のピア並びと再送パラメータから構築する。
    pub fn from_network(network: &NetworkConfig) -> Self {
        Self::new(
            network.peers.clone(),
            network.max_retries,
            network.retry_backoff_ms,
        )
    }

    pub fn peer_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// ピアインデックスをエンドポイント文字列に解決する。
    pub fn lookup(&self, peer: PeerIndex) -> RpcResult<&str> {
        self.endpoints
            .get(peer)
            .map(String::as_str)
            .ok_or(RpcError::UnknownPeer { peer })
    }

    /// `attempt` 回目 (0始まり) の再送までの待ち時間。
    /// 基本は backoff_ms * 2^attempt で、そこに宛先とattemptから決まる
    /// 決定的なジッタ (基本値の0〜100%) を足す。
    pub fn retry_delay(&self, peer: PeerIndex, attempt: u32) -> Duration {
        let base = self.backoff_ms.saturating_mul(1u64 << attempt.min(16));
        let seed = ((peer as u64) << 32) | attempt as u64;
        let jitter = if base == 0 {
            0
        } else {
            xxh64(&seed.to_le_bytes(), 0) % (base + 1)
        };
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> AddressBook {
        AddressBook::new(
            vec!["node0".to_string(), "node1".to_string()],
            3,
            10,
        )
    }

    #[test]
    fn test_from_network_carries_config_values() {
        let mut network = crate::config::ServerConfig::default().network;
        network.peers = vec!["a".to_string(), "b".to_string()];
        network.max_retries = 5;
        network.retry_backoff_ms = 7;
        let book = AddressBook::from_network(&network);
        assert_eq!(book.peer_count(), 2);
        assert_eq!(book.max_retries(), 5);
        assert_eq!(book.lookup(1).unwrap(), "b");
        // 1回目の待ちは基本値7msにジッタを足した範囲
        let delay = book.retry_delay(0, 0).as_millis() as u64;
        assert!((7..=14).contains(&delay));
    }

    #[test]
    fn test_lookup() {
        let book = book();
        assert_eq!(book.lookup(0).unwrap(), "node0");
        assert_eq!(book.lookup(1).unwrap(), "node1");
        assert!(matches!(
            book.lookup(2),
            Err(RpcError::UnknownPeer { peer: 2 })
        ));
    }

    #[test]
    fn test_retry_delay_bounded_exponential() {
        let book = book();
        for attempt in 0..3 {
            let base = 10u64 << attempt;
            let delay = book.retry_delay(0, attempt).as_millis() as u64;
            assert!((base..=2 * base).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_retry_delay_deterministic_but_spread() {
        let book = book();
        assert_eq!(book.retry_delay(0, 1), book.retry_delay(0, 1));
        // 別ピアは別のジッタを引く (完全一致しないことまでは保証しないが
        // 系列全体が一致することはまずない)
        let a: Vec<_> = (0..8).map(|n| book.retry_delay(0, n)).collect();
        let b: Vec<_> = (0..8).map(|n| book.retry_delay(1, n)).collect();
        assert_ne!(a, b);
    }
}
