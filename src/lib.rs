//! ScatterFS: ノードローカルストレージを束ねる分散チャンク配置エンジン
//!
//! 各ピアが自分のローカルファイルシステム上にチャンクとメタデータの
//! 断片を持ち、クライアントは決定的な配置計算だけで所有ピアを特定して
//! 並列にI/Oを発行する。中央サーバも配置表の同期も存在しない。
//!
//! - [`distribution`] — チャンク/メタデータの所有ピアを決める純粋計算
//! - [`storage`] — 1チャンク1ファイルのノードローカルストレージ
//! - [`kv`] / [`metadata`] — マージオペランドでサイズ会計を行うメタデータ層
//! - [`rpc`] — 型付きメッセージとピア側ハンドラ、ループバックトランスポート
//! - [`daemon`] — ピアごとの状態の明示的な構築
//! - [`client`] — スキャッタ・ギャザーI/Oエンジン

pub mod client;
pub mod config;
pub mod daemon;
pub mod distribution;
pub mod kv;
pub mod logging;
pub mod metadata;
pub mod rpc;
pub mod storage;

pub use client::{ApiError, ApiResult, ScatterGatherEngine};
pub use config::{AddressingMode, ServerConfig};
pub use daemon::PeerContext;
pub use distribution::{Distributor, PeerIndex};
pub use metadata::{Metadata, MetadataStore, UidAllocator};
pub use storage::{ChunkStat, ChunkStorage};
