//! インプロセス・ループバックトランスポート
//!
//! 同一プロセス内に構築した複数のPeerContextを実ネットワークなしで
//! 結線する。配線の正しさ (配置の再導出、ジオメトリ、エラー伝搬、
//! 再送ポリシー) を通しで検証するための実装で、ピアの解決と再送間隔は
//! AddressBookに従う。到達不能ピアはテスト用の障害注入で再現する。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::daemon::PeerContext;
use crate::distribution::PeerIndex;
use crate::rpc::address_book::AddressBook;
use crate::rpc::error::{RpcError, RpcResult};
use crate::rpc::handlers;
use crate::rpc::messages::{Request, Response};
use crate::rpc::PeerTransport;

pub struct LoopbackTransport {
    address_book: AddressBook,
    peers: HashMap<String, Arc<PeerContext>>,
    /// ピアごとの残り障害回数。正の間はそのピアへの送信が到達しない。
    outages: Mutex<HashMap<PeerIndex, u32>>,
}

impl LoopbackTransport {
    /// ピア群を結線する。AddressBookのエンドポイントはノードIDで、
    /// 並びは各ピアの設定のnetwork.peersと一致していなければならない。
    pub fn new(address_book: AddressBook, peers: Vec<Arc<PeerContext>>) -> Self {
        let peers = peers
            .into_iter()
            .map(|ctx| (ctx.node_id().to_string(), ctx))
            .collect();
        Self {
            address_book,
            peers,
            outages: Mutex::new(HashMap::new()),
        }
    }

    /// 指定ピアへの次のfailures回の送信を到達不能にする (障害試験用)。
    pub fn inject_outage(&self, peer: PeerIndex, failures: u32) {
        self.outages
            .lock()
            .expect("outage table poisoned")
            .insert(peer, failures);
    }

    fn peer_unreachable(&self, peer: PeerIndex) -> bool {
        let mut outages = self.outages.lock().expect("outage table poisoned");
        match outages.get_mut(&peer) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(&self, target: PeerIndex, request: Request) -> RpcResult<Response> {
        // 未登録ピアは設定不整合なので再送しない
        let endpoint = self.address_book.lookup(target)?;
        let ctx = self
            .peers
            .get(endpoint)
            .ok_or(RpcError::UnknownPeer { peer: target })?;

        let attempts = self.address_book.max_retries();
        for attempt in 0..attempts {
            if self.peer_unreachable(target) {
                tracing::warn!(target, endpoint, attempt, "Peer unreachable, backing off");
                std::thread::sleep(self.address_book.retry_delay(target, attempt));
                continue;
            }
            tracing::trace!(target, endpoint, attempt, "Dispatching loopback request");
            return handlers::handle(ctx, request).map_err(|code| RpcError::Remote { code });
        }
        Err(RpcError::RetriesExhausted {
            peer: target,
            attempts,
        })
    }
}
