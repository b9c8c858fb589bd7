//! RPC層のエラー型

use crate::distribution::PeerIndex;
use crate::rpc::messages::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("No endpoint registered for peer {peer}")]
    UnknownPeer { peer: PeerIndex },

    #[error("Peer {peer} unreachable after {attempts} attempt(s)")]
    RetriesExhausted { peer: PeerIndex, attempts: u32 },

    #[error("Remote peer returned: {code}")]
    Remote { code: ErrorCode },

    #[error("Unexpected response variant for {operation}")]
    UnexpectedResponse { operation: &'static str },
}

pub type RpcResult<T> = Result<T, RpcError>;
