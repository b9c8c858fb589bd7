//! ピア間通信層
//!
//! 型付きメッセージ、ワイヤエラーコード、ピア解決、ピア側ハンドラ、
//! そしてトランスポート抽象。実ネットワークのマーシャリングは
//! この層の外側の責務で、クレート内にはループバック実装だけを持つ。

pub mod address_book;
pub mod error;
pub mod handlers;
pub mod loopback;
pub mod messages;

use async_trait::async_trait;

use crate::distribution::PeerIndex;

pub use address_book::AddressBook;
pub use error::{RpcError, RpcResult};
pub use loopback::LoopbackTransport;
pub use messages::{ChunkSegment, ErrorCode, Request, Response};

/// リクエストを指定ピアに届けてレスポンスを待つトランスポート抽象
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, target: PeerIndex, request: Request) -> RpcResult<Response>;
}
