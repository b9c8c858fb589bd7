//! ピアごとのデーモン状態
//!
//! 1ピア分の協調オブジェクト一式を明示的に構築して束ねる。グローバル
//! シングルトンは置かず、ハンドラにもテストにもこのコンテキストを
//! 参照で渡す。

use crate::config::{ConfigError, ServerConfig};
use crate::distribution::{Distributor, PeerIndex};
use crate::metadata::{MetadataStore, UidAllocator, UidError};
use crate::storage::{ChunkStorage, ChunkStorageError};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage initialization failed: {0}")]
    Storage(#[from] ChunkStorageError),

    #[error("Uid allocator initialization failed: {0}")]
    Uid(#[from] UidError),
}

/// 1ピア分の状態 (設定、ストア群、配置ポリシー、アロケータ)
pub struct PeerContext {
    config: ServerConfig,
    localhost: PeerIndex,
    metadata: MetadataStore,
    storage: ChunkStorage,
    distributor: Distributor,
    allocator: UidAllocator,
}

impl PeerContext {
    /// 設定からピア状態を構築する。配置ポリシーはピア数1なら
    /// LocalOnly、それ以外はSimpleHash。
    pub fn new(config: ServerConfig) -> Result<Self, DaemonError> {
        let peer_count = config.network.peers.len();
        let localhost = config.localhost_index()?;
        let distributor = if peer_count == 1 {
            Distributor::LocalOnly { localhost }
        } else {
            Distributor::SimpleHash {
                localhost,
                peer_count,
            }
        };
        Self::with_distributor(config, distributor)
    }

    /// 配置ポリシーを外から与える構築 (ピン留め構成・テスト用)。
    /// デプロイメント内の全ピアとクライアントが同じポリシーで
    /// 構築されていることが正しさの前提になる。
    pub fn with_distributor(
        config: ServerConfig,
        distributor: Distributor,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let localhost = config.localhost_index()?;
        let peer_count = config.network.peers.len();
        let storage = ChunkStorage::new(&config.node.data_dir, config.storage.chunk_size)?;
        let allocator = UidAllocator::new(peer_count as u64, localhost as u64)?;

        tracing::info!(
            node_id = %config.node.node_id,
            peer_index = localhost,
            peer_count,
            chunk_size = config.storage.chunk_size,
            "Peer context initialized"
        );

        Ok(Self {
            config,
            localhost,
            metadata: MetadataStore::new(),
            storage,
            distributor,
            allocator,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.node_id
    }

    pub fn localhost(&self) -> PeerIndex {
        self.localhost
    }

    pub fn chunk_size(&self) -> u64 {
        self.config.storage.chunk_size
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn storage(&self) -> &ChunkStorage {
        &self.storage
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn allocator(&self) -> &UidAllocator {
        &self.allocator
    }
}
