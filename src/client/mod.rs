//! スキャッタ・ギャザーI/Oエンジン
//!
//! クライアント側でバイト範囲をチャンク格子に割り、ピアごとに1リクエスト
//! へ束ねて並列に発行する。全リクエストを発行してから待ち、失敗があっても
//! 全レスポンスを回収する。部分的に完了した書き込みのロールバックはしない。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;

use crate::distribution::Distributor;
use crate::metadata::store::DirEntry;
use crate::metadata::types::Metadata;
use crate::rpc::handlers::chunk_payload_len;
use crate::rpc::{PeerTransport, Request, Response, RpcError};
use crate::storage::ChunkStat;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Peer disagrees on chunk size: expected {expected}, got {got}")]
    ChunkSizeMismatch { expected: u64, got: u64 },

    #[error("Truncate cannot extend: {old_size} -> {new_size}")]
    TruncateExtends { old_size: u64, new_size: u64 },
}

pub type ApiResult<T> = Result<T, ApiError>;

/// スキャッタ・ギャザーエンジン
///
/// ディストリビュータとチャンクサイズはデーモン側と同一設定で
/// 構築されていなければならない。配置の答え合わせはどこにもなく、
/// 一致こそが正しさの根拠になる。
pub struct ScatterGatherEngine {
    transport: Arc<dyn PeerTransport>,
    distributor: Distributor,
    chunk_size: u64,
}

impl ScatterGatherEngine {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        distributor: Distributor,
        chunk_size: u64,
    ) -> Self {
        Self {
            transport,
            distributor,
            chunk_size,
        }
    }

    /// バイト範囲を書き込む。戻り値は転送済みバイト数。
    ///
    /// appendの場合は先にメタデータ所有者でサイズ更新を行い、返ってきた
    /// 更新後サイズから自分の書き込み開始オフセットを導く。非appendでも
    /// サイズ境界の引き上げを先に送る。データ送信はピアごとに1リクエスト
    /// で、失敗時も完了済みピアの効果は残る。
    pub async fn write(
        &self,
        key: &str,
        identity: &str,
        buf: &[u8],
        offset: u64,
        append: bool,
    ) -> ApiResult<u64> {
        assert!(!buf.is_empty(), "zero-length write");
        let len = buf.len() as u64;

        let size_bound = if append { len } else { offset + len };
        let new_size = self.update_size(key, size_bound, append).await?;
        let offset = if append { new_size - len } else { offset };

        let chunk_start = offset / self.chunk_size;
        let chunk_end = (offset + len - 1) / self.chunk_size;
        let in_first = offset % self.chunk_size;

        // チャンク昇順でピアごとの送信バッファを組み立てる
        let mut per_target: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut pos = 0usize;
        for chunk_index in chunk_start..=chunk_end {
            let l = chunk_payload_len(chunk_index, chunk_start, chunk_end, in_first, len, self.chunk_size)
                as usize;
            let target = self.distributor.locate_data(identity, chunk_index);
            per_target
                .entry(target)
                .or_default()
                .extend_from_slice(&buf[pos..pos + l]);
            pos += l;
        }

        tracing::debug!(
            identity,
            offset,
            len,
            targets = per_target.len(),
            "Dispatching scatter write"
        );

        // 全リクエストを発行してから待つ
        let futures = per_target.into_iter().map(|(peer, data)| {
            let request = Request::WriteChunkRange {
                identity: identity.to_string(),
                chunk_start,
                chunk_end,
                offset: in_first,
                total_size: len,
                data,
            };
            async move { self.transport.send(peer, request).await }
        });

        let mut written = 0u64;
        let mut first_error = None;
        for result in join_all(futures).await {
            match result {
                Ok(Response::Written { bytes }) => written += bytes,
                Ok(_) => {
                    first_error.get_or_insert(RpcError::UnexpectedResponse { operation: "write" });
                }
                Err(e) => {
                    tracing::warn!("Scatter write leg failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => {
                tracing::warn!(identity, written, "Scatter write failed with partial effects");
                Err(e.into())
            }
            None => Ok(written),
        }
    }

    /// バイト範囲を読む。戻り値は実際に転送されたバイト数で、どのピアにも
    /// ないチャンクや書かれていない末尾は呼び出し側バッファのゼロのまま
    /// 残る。
    pub async fn read(&self, identity: &str, buf: &mut [u8], offset: u64) -> ApiResult<u64> {
        assert!(!buf.is_empty(), "zero-length read");
        let len = buf.len() as u64;

        let chunk_start = offset / self.chunk_size;
        let chunk_end = (offset + len - 1) / self.chunk_size;
        let in_first = offset % self.chunk_size;

        let targets: BTreeSet<usize> = (chunk_start..=chunk_end)
            .map(|chunk_index| self.distributor.locate_data(identity, chunk_index))
            .collect();

        let futures = targets.into_iter().map(|peer| {
            let request = Request::ReadChunkRange {
                identity: identity.to_string(),
                chunk_start,
                chunk_end,
                offset: in_first,
                total_size: len,
            };
            async move { self.transport.send(peer, request).await }
        });

        let mut read = 0u64;
        let mut first_error = None;
        for result in join_all(futures).await {
            match result {
                Ok(Response::Read { segments }) => {
                    for segment in segments {
                        let global = self.segment_position(segment.chunk_index, chunk_start, in_first);
                        let end = global as usize + segment.data.len();
                        buf[global as usize..end].copy_from_slice(&segment.data);
                        read += segment.data.len() as u64;
                    }
                }
                Ok(_) => {
                    first_error.get_or_insert(RpcError::UnexpectedResponse { operation: "read" });
                }
                Err(e) => {
                    tracing::warn!("Gather read leg failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(read),
        }
    }

    /// チャンクがバッファ内で始まる位置
    fn segment_position(&self, chunk_index: u64, chunk_start: u64, in_first: u64) -> u64 {
        if chunk_index == chunk_start {
            0
        } else {
            (self.chunk_size - in_first) + (chunk_index - chunk_start - 1) * self.chunk_size
        }
    }

    /// サイズをnew_sizeまで切り詰める。メタデータの切り下げに続けて、
    /// 影響範囲のチャンクを持ちうる全ピアへトリムを並列発行する。
    /// データ側の失敗は宙に浮いたチャンクを残すため、1件でも失敗したら
    /// 呼び出し全体を失敗にする。
    pub async fn truncate(
        &self,
        key: &str,
        identity: &str,
        old_size: u64,
        new_size: u64,
    ) -> ApiResult<()> {
        if new_size > old_size {
            return Err(ApiError::TruncateExtends { old_size, new_size });
        }
        let meta_owner = self.distributor.locate_metadata(key);
        let response = self
            .transport
            .send(
                meta_owner,
                Request::DecreaseSize {
                    key: key.to_string(),
                    size: new_size,
                },
            )
            .await?;
        if !matches!(response, Response::Ack) {
            return Err(RpcError::UnexpectedResponse { operation: "truncate" }.into());
        }
        if old_size == 0 {
            return Ok(());
        }

        let first_affected = new_size / self.chunk_size;
        let last_chunk = (old_size - 1) / self.chunk_size;
        let targets: BTreeSet<usize> = (first_affected..=last_chunk)
            .map(|chunk_index| self.distributor.locate_data(identity, chunk_index))
            .collect();

        let futures = targets.into_iter().map(|peer| {
            let request = Request::TruncateChunkRange {
                identity: identity.to_string(),
                new_size,
            };
            async move { self.transport.send(peer, request).await }
        });

        let mut first_error = None;
        for result in join_all(futures).await {
            if let Err(e) = result {
                tracing::warn!(identity, "Truncate leg failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// 全ピアの容量をチャンク換算で合算する。チャンクサイズの合意が
    /// 取れていないピアがいれば失敗する。
    pub async fn chunk_stat(&self) -> ApiResult<ChunkStat> {
        let futures = (0..self.distributor.peer_count()).map(|peer| {
            async move { self.transport.send(peer, Request::ChunkStat).await }
        });

        let mut total = ChunkStat {
            chunk_size: self.chunk_size,
            chunk_total: 0,
            chunk_free: 0,
        };
        for result in join_all(futures).await {
            match result? {
                Response::Stat { stat } => {
                    if stat.chunk_size != self.chunk_size {
                        return Err(ApiError::ChunkSizeMismatch {
                            expected: self.chunk_size,
                            got: stat.chunk_size,
                        });
                    }
                    total.chunk_total += stat.chunk_total;
                    total.chunk_free += stat.chunk_free;
                }
                _ => {
                    return Err(RpcError::UnexpectedResponse {
                        operation: "chunk_stat",
                    }
                    .into())
                }
            }
        }
        Ok(total)
    }

    /// メタデータ所有者でエントリを作成し、データアドレッシング用の
    /// 識別文字列を返す。
    pub async fn create(&self, key: &str, metadata: &Metadata) -> ApiResult<String> {
        let owner = self.distributor.locate_metadata(key);
        let serialized = metadata
            .serialize()
            .map_err(|_| RpcError::UnexpectedResponse { operation: "create" })?;
        match self
            .transport
            .send(
                owner,
                Request::Create {
                    key: key.to_string(),
                    metadata: serialized,
                },
            )
            .await?
        {
            Response::Created { identity } => Ok(identity),
            _ => Err(RpcError::UnexpectedResponse { operation: "create" }.into()),
        }
    }

    pub async fn get_attributes(&self, key: &str) -> ApiResult<Metadata> {
        let owner = self.distributor.locate_metadata(key);
        match self
            .transport
            .send(
                owner,
                Request::GetAttributes {
                    key: key.to_string(),
                },
            )
            .await?
        {
            Response::Attributes { metadata } => Metadata::deserialize(&metadata)
                .map_err(|_| RpcError::UnexpectedResponse { operation: "stat" }.into()),
            _ => Err(RpcError::UnexpectedResponse { operation: "stat" }.into()),
        }
    }

    pub async fn get_size(&self, key: &str) -> ApiResult<u64> {
        let owner = self.distributor.locate_metadata(key);
        match self
            .transport
            .send(owner, Request::GetSize { key: key.to_string() })
            .await?
        {
            Response::Size { size } => Ok(size),
            _ => Err(RpcError::UnexpectedResponse { operation: "get_size" }.into()),
        }
    }

    /// エントリとそのチャンクを削除する。メタデータを先に外してから、
    /// 全ピアへチャンク破棄を並列発行する。
    pub async fn remove(&self, key: &str, identity: &str) -> ApiResult<()> {
        let owner = self.distributor.locate_metadata(key);
        self.transport
            .send(owner, Request::Remove { key: key.to_string() })
            .await?;

        let futures = (0..self.distributor.peer_count()).map(|peer| {
            let request = Request::DestroyChunkSpace {
                identity: identity.to_string(),
            };
            async move { self.transport.send(peer, request).await }
        });

        let mut first_error = None;
        for result in join_all(futures).await {
            if let Err(e) = result {
                tracing::warn!(identity, "Chunk destroy leg failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// 同一メタデータ所有者内でのリネーム。
    pub async fn rename(&self, old_key: &str, new_key: &str) -> ApiResult<()> {
        let metadata = self.get_attributes(old_key).await?;
        let owner = self.distributor.locate_metadata(old_key);
        let serialized = metadata
            .serialize()
            .map_err(|_| RpcError::UnexpectedResponse { operation: "rename" })?;
        match self
            .transport
            .send(
                owner,
                Request::UpdateAttributes {
                    old_key: old_key.to_string(),
                    new_key: new_key.to_string(),
                    metadata: serialized,
                },
            )
            .await?
        {
            Response::Ack => Ok(()),
            _ => Err(RpcError::UnexpectedResponse { operation: "rename" }.into()),
        }
    }

    /// ディレクトリリスティング。エントリは全ピアに散っているので
    /// ファンアウトして回収し、名前順に並べて返す。
    pub async fn list_directory(&self, dir: &str) -> ApiResult<Vec<DirEntry>> {
        let futures = self
            .distributor
            .locate_directory_fanout(dir)
            .into_iter()
            .map(|peer| {
                let request = Request::ListDirectory {
                    dir: dir.to_string(),
                };
                async move { self.transport.send(peer, request).await }
            });

        let mut entries = Vec::new();
        for result in join_all(futures).await {
            match result? {
                Response::Dirents { entries: part } => entries.extend(part),
                _ => {
                    return Err(RpcError::UnexpectedResponse {
                        operation: "list_directory",
                    }
                    .into())
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn update_size(&self, key: &str, size: u64, append: bool) -> ApiResult<u64> {
        let owner = self.distributor.locate_metadata(key);
        match self
            .transport
            .send(
                owner,
                Request::UpdateSize {
                    key: key.to_string(),
                    size,
                    append,
                },
            )
            .await?
        {
            Response::Size { size } => Ok(size),
            _ => Err(RpcError::UnexpectedResponse {
                operation: "update_size",
            }
            .into()),
        }
    }
}
