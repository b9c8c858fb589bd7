//! ピア側の操作ハンドラ
//!
//! トランスポートから受け取ったリクエストをPeerContextに対して実行する。
//! ローカルのエラーはワイヤコードに潰し、詳細はこちら側でログする。

use crate::daemon::PeerContext;
use crate::metadata::types::Metadata;
use crate::rpc::messages::{ChunkSegment, ErrorCode, Request, Response};

/// ワイヤから来たジオメトリの整合性検査。
///
/// `offset + total_size` が末尾チャンクの区間内で終わらない組は
/// chunk_payload_lenの算術を破綻させるため、ハンドラは計算に入る前に
/// 必ずこれで弾く。
fn valid_geometry(
    chunk_start: u64,
    chunk_end: u64,
    offset: u64,
    total_size: u64,
    chunk_size: u64,
) -> bool {
    if chunk_end < chunk_start || offset >= chunk_size || total_size == 0 {
        return false;
    }
    let Some(end) = offset.checked_add(total_size) else {
        return false;
    };
    let Some(full_chunks) = (chunk_end - chunk_start).checked_mul(chunk_size) else {
        return false;
    };
    let Some(span) = full_chunks.checked_add(chunk_size) else {
        return false;
    };
    end > full_chunks && end <= span
}

/// 操作ジオメトリから、指定チャンクが運ぶバイト数を計算する。
///
/// クライアントのバッファ分割とデーモンの再導出が同じ式を使うことで、
/// チャンクIDの列挙をワイヤに載せずに済んでいる。前提として
/// ジオメトリが整合していること (valid_geometry) を要求する。
pub fn chunk_payload_len(
    chunk_index: u64,
    chunk_start: u64,
    chunk_end: u64,
    offset: u64,
    total_size: u64,
    chunk_size: u64,
) -> u64 {
    if chunk_start == chunk_end {
        total_size
    } else if chunk_index == chunk_start {
        chunk_size - offset
    } else if chunk_index == chunk_end {
        total_size - (chunk_size - offset) - (chunk_end - chunk_start - 1) * chunk_size
    } else {
        chunk_size
    }
}

/// リクエストを実行してレスポンスまたはワイヤエラーコードを返す。
pub fn handle(ctx: &PeerContext, request: Request) -> Result<Response, ErrorCode> {
    match request {
        Request::Create { key, metadata } => create(ctx, &key, &metadata),
        Request::Remove { key } => remove(ctx, &key),
        Request::GetAttributes { key } => get_attributes(ctx, &key),
        Request::UpdateAttributes {
            old_key,
            new_key,
            metadata,
        } => update_attributes(ctx, &old_key, &new_key, &metadata),
        Request::GetSize { key } => {
            let size = ctx.metadata().get_size(&key).map_err(log_code(&key))?;
            Ok(Response::Size { size })
        }
        Request::UpdateSize { key, size, append } => update_size(ctx, &key, size, append),
        Request::DecreaseSize { key, size } => {
            ctx.metadata()
                .decrease_size(&key, size)
                .map_err(log_code(&key))?;
            Ok(Response::Ack)
        }
        Request::ListDirectory { dir } => list_directory(ctx, &dir),
        Request::WriteChunkRange {
            identity,
            chunk_start,
            chunk_end,
            offset,
            total_size,
            data,
        } => write_chunk_range(ctx, &identity, chunk_start, chunk_end, offset, total_size, &data),
        Request::ReadChunkRange {
            identity,
            chunk_start,
            chunk_end,
            offset,
            total_size,
        } => read_chunk_range(ctx, &identity, chunk_start, chunk_end, offset, total_size),
        Request::TruncateChunkRange { identity, new_size } => {
            truncate_chunk_range(ctx, &identity, new_size)
        }
        Request::DestroyChunkSpace { identity } => {
            ctx.storage()
                .destroy_chunk_space(&identity)
                .map_err(log_code(&identity))?;
            Ok(Response::Ack)
        }
        Request::ChunkStat => {
            let stat = ctx.storage().chunk_stat().map_err(log_code("chunk_stat"))?;
            Ok(Response::Stat { stat })
        }
    }
}

fn log_code<'a, E>(context: &'a str) -> impl Fn(E) -> ErrorCode + 'a
where
    E: std::fmt::Display + Into<ErrorCode>,
{
    move |e| {
        tracing::warn!("Request failed for {}: {}", context, e);
        e.into()
    }
}

fn create(ctx: &PeerContext, key: &str, metadata: &str) -> Result<Response, ErrorCode> {
    use crate::config::AddressingMode;

    let mut metadata = Metadata::deserialize(metadata).map_err(log_code(key))?;
    metadata.init_times();
    let identity = match ctx.config().node.addressing_mode {
        AddressingMode::Path => key.to_string(),
        AddressingMode::Uid => {
            let uid = ctx.allocator().generate().map_err(log_code(key))?;
            metadata.inode = uid;
            uid.to_string()
        }
    };
    ctx.metadata().create(key, &metadata).map_err(log_code(key))?;
    Ok(Response::Created { identity })
}

fn remove(ctx: &PeerContext, key: &str) -> Result<Response, ErrorCode> {
    let metadata = ctx.metadata().get(key).map_err(log_code(key))?;
    if metadata.is_directory() && !ctx.metadata().get_dirents(key).map_err(log_code(key))?.is_empty()
    {
        return Err(ErrorCode::DirectoryNotEmpty);
    }
    ctx.metadata().remove(key).map_err(log_code(key))?;
    Ok(Response::Ack)
}

fn get_attributes(ctx: &PeerContext, key: &str) -> Result<Response, ErrorCode> {
    let metadata = ctx.metadata().get(key).map_err(log_code(key))?;
    Ok(Response::Attributes {
        metadata: metadata.serialize().map_err(log_code(key))?,
    })
}

fn update_attributes(
    ctx: &PeerContext,
    old_key: &str,
    new_key: &str,
    metadata: &str,
) -> Result<Response, ErrorCode> {
    let metadata = Metadata::deserialize(metadata).map_err(log_code(old_key))?;
    if old_key != new_key
        && ctx.distributor().locate_metadata(new_key) != ctx.localhost()
    {
        // リネーム先のメタデータ所有者が別ピアになる移動は多キー
        // トランザクションを要するため受け付けない
        return Err(ErrorCode::Unsupported);
    }
    ctx.metadata()
        .update(old_key, new_key, &metadata)
        .map_err(log_code(old_key))?;
    Ok(Response::Ack)
}

fn update_size(ctx: &PeerContext, key: &str, size: u64, append: bool) -> Result<Response, ErrorCode> {
    if ctx.metadata().get(key).map_err(log_code(key))?.is_directory() {
        return Err(ErrorCode::IsADirectory);
    }
    let size = ctx
        .metadata()
        .increase_size(key, size, append)
        .map_err(log_code(key))?;
    Ok(Response::Size { size })
}

fn list_directory(ctx: &PeerContext, dir: &str) -> Result<Response, ErrorCode> {
    // ディレクトリ自身のメタデータ所有者だけが存在検査を行える。
    // それ以外のピアはローカルに散ったエントリを無検査で返す。
    let entries = if ctx.distributor().locate_metadata(dir) == ctx.localhost() {
        ctx.metadata().get_dirents(dir).map_err(log_code(dir))?
    } else {
        ctx.metadata().scan_dirents(dir).map_err(log_code(dir))?
    };
    Ok(Response::Dirents { entries })
}

fn write_chunk_range(
    ctx: &PeerContext,
    identity: &str,
    chunk_start: u64,
    chunk_end: u64,
    offset: u64,
    total_size: u64,
    data: &[u8],
) -> Result<Response, ErrorCode> {
    let chunk_size = ctx.chunk_size();
    if !valid_geometry(chunk_start, chunk_end, offset, total_size, chunk_size) {
        tracing::warn!(
            identity,
            chunk_start,
            chunk_end,
            offset,
            total_size,
            "Inconsistent write geometry"
        );
        return Err(ErrorCode::InvalidArgument);
    }

    let mut pos = 0u64;
    let mut written = 0u64;
    for chunk_index in chunk_start..=chunk_end {
        if ctx.distributor().locate_data(identity, chunk_index) != ctx.localhost() {
            continue;
        }
        let len = chunk_payload_len(chunk_index, chunk_start, chunk_end, offset, total_size, chunk_size);
        let in_chunk_offset = if chunk_index == chunk_start { offset } else { 0 };
        let end = pos + len;
        let Some(slice) = data.get(pos as usize..end as usize) else {
            tracing::warn!(
                identity,
                chunk_index,
                "Write payload shorter than derived chunk lengths"
            );
            return Err(ErrorCode::InvalidArgument);
        };
        written += ctx
            .storage()
            .write_chunk(identity, chunk_index, slice, in_chunk_offset)
            .map_err(log_code(identity))?;
        pos = end;
    }
    if pos != data.len() as u64 {
        tracing::warn!(
            identity,
            expected = pos,
            got = data.len(),
            "Write payload longer than derived chunk lengths"
        );
        return Err(ErrorCode::InvalidArgument);
    }
    Ok(Response::Written { bytes: written })
}

fn read_chunk_range(
    ctx: &PeerContext,
    identity: &str,
    chunk_start: u64,
    chunk_end: u64,
    offset: u64,
    total_size: u64,
) -> Result<Response, ErrorCode> {
    let chunk_size = ctx.chunk_size();
    if !valid_geometry(chunk_start, chunk_end, offset, total_size, chunk_size) {
        tracing::warn!(
            identity,
            chunk_start,
            chunk_end,
            offset,
            total_size,
            "Inconsistent read geometry"
        );
        return Err(ErrorCode::InvalidArgument);
    }

    let mut segments = Vec::new();
    for chunk_index in chunk_start..=chunk_end {
        if ctx.distributor().locate_data(identity, chunk_index) != ctx.localhost() {
            continue;
        }
        let len = chunk_payload_len(chunk_index, chunk_start, chunk_end, offset, total_size, chunk_size);
        let in_chunk_offset = if chunk_index == chunk_start { offset } else { 0 };
        let mut data = vec![0u8; len as usize];
        let read = ctx
            .storage()
            .read_chunk(identity, chunk_index, &mut data, in_chunk_offset)
            .map_err(log_code(identity))?;
        data.truncate(read as usize);
        if !data.is_empty() {
            segments.push(ChunkSegment { chunk_index, data });
        }
    }
    Ok(Response::Read { segments })
}

fn truncate_chunk_range(
    ctx: &PeerContext,
    identity: &str,
    new_size: u64,
) -> Result<Response, ErrorCode> {
    let chunk_size = ctx.chunk_size();
    let boundary = new_size / chunk_size;
    let remainder = new_size % chunk_size;

    if remainder > 0 && ctx.distributor().locate_data(identity, boundary) == ctx.localhost() {
        ctx.storage()
            .truncate_chunk(identity, boundary, remainder)
            .map_err(log_code(identity))?;
    }
    let trim_start = boundary + u64::from(remainder > 0);
    ctx.storage()
        .trim_chunk_space(identity, trim_start, u64::MAX)
        .map_err(log_code(identity))?;
    Ok(Response::Ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::distribution::Distributor;
    use tempfile::TempDir;

    fn local_ctx(chunk_size: u64) -> (TempDir, PeerContext) {
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig::default();
        config.node.data_dir = dir.path().to_path_buf();
        config.storage.chunk_size = chunk_size;
        let ctx = PeerContext::new(config).unwrap();
        (dir, ctx)
    }

    fn create_file(ctx: &PeerContext, key: &str) {
        let m = Metadata::new_regular(0o644);
        let resp = handle(
            ctx,
            Request::Create {
                key: key.to_string(),
                metadata: m.serialize().unwrap(),
            },
        )
        .unwrap();
        assert!(matches!(resp, Response::Created { .. }));
    }

    #[test]
    fn test_chunk_payload_len_geometry() {
        // 10バイトをチャンクサイズ4、オフセット0で書く: 4 + 4 + 2
        assert_eq!(chunk_payload_len(0, 0, 2, 0, 10, 4), 4);
        assert_eq!(chunk_payload_len(1, 0, 2, 0, 10, 4), 4);
        assert_eq!(chunk_payload_len(2, 0, 2, 0, 10, 4), 2);

        // オフセット3から6バイト: 1 + 4 + 1
        assert_eq!(chunk_payload_len(0, 0, 2, 3, 6, 4), 1);
        assert_eq!(chunk_payload_len(1, 0, 2, 3, 6, 4), 4);
        assert_eq!(chunk_payload_len(2, 0, 2, 3, 6, 4), 1);

        // 単一チャンク
        assert_eq!(chunk_payload_len(5, 5, 5, 2, 2, 4), 2);
    }

    #[test]
    fn test_create_get_remove_cycle() {
        let (_dir, ctx) = local_ctx(4);
        create_file(&ctx, "/f");

        let resp = handle(
            &ctx,
            Request::GetAttributes {
                key: "/f".to_string(),
            },
        )
        .unwrap();
        let Response::Attributes { metadata } = resp else {
            panic!("wrong variant");
        };
        assert!(Metadata::deserialize(&metadata).unwrap().is_regular());

        handle(
            &ctx,
            Request::Remove {
                key: "/f".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            handle(
                &ctx,
                Request::GetSize {
                    key: "/f".to_string()
                }
            )
            .unwrap_err(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_create_duplicate_reports_exists() {
        let (_dir, ctx) = local_ctx(4);
        create_file(&ctx, "/f");
        let m = Metadata::new_regular(0o644);
        assert_eq!(
            handle(
                &ctx,
                Request::Create {
                    key: "/f".to_string(),
                    metadata: m.serialize().unwrap(),
                }
            )
            .unwrap_err(),
            ErrorCode::Exists
        );
    }

    #[test]
    fn test_remove_nonempty_directory_refused() {
        let (_dir, ctx) = local_ctx(4);
        let d = Metadata::new_directory(0o755);
        handle(
            &ctx,
            Request::Create {
                key: "/d".to_string(),
                metadata: d.serialize().unwrap(),
            },
        )
        .unwrap();
        create_file(&ctx, "/d/child");

        assert_eq!(
            handle(
                &ctx,
                Request::Remove {
                    key: "/d".to_string()
                }
            )
            .unwrap_err(),
            ErrorCode::DirectoryNotEmpty
        );
    }

    #[test]
    fn test_update_size_on_directory_refused() {
        let (_dir, ctx) = local_ctx(4);
        let d = Metadata::new_directory(0o755);
        handle(
            &ctx,
            Request::Create {
                key: "/d".to_string(),
                metadata: d.serialize().unwrap(),
            },
        )
        .unwrap();

        assert_eq!(
            handle(
                &ctx,
                Request::UpdateSize {
                    key: "/d".to_string(),
                    size: 4,
                    append: true,
                }
            )
            .unwrap_err(),
            ErrorCode::IsADirectory
        );
    }

    #[test]
    fn test_write_then_read_chunk_range() {
        let (_dir, ctx) = local_ctx(4);
        create_file(&ctx, "/f");

        let resp = handle(
            &ctx,
            Request::WriteChunkRange {
                identity: "/f".to_string(),
                chunk_start: 0,
                chunk_end: 2,
                offset: 0,
                total_size: 10,
                data: b"0123456789".to_vec(),
            },
        )
        .unwrap();
        let Response::Written { bytes } = resp else {
            panic!("wrong variant");
        };
        assert_eq!(bytes, 10);

        let resp = handle(
            &ctx,
            Request::ReadChunkRange {
                identity: "/f".to_string(),
                chunk_start: 0,
                chunk_end: 2,
                offset: 0,
                total_size: 10,
            },
        )
        .unwrap();
        let Response::Read { segments } = resp else {
            panic!("wrong variant");
        };
        let joined: Vec<u8> = segments.iter().flat_map(|s| s.data.clone()).collect();
        assert_eq!(joined, b"0123456789");
    }

    #[cfg(feature = "mtime")]
    #[test]
    fn test_create_stamps_times() {
        let (_dir, ctx) = local_ctx(4);
        create_file(&ctx, "/f");
        let m = ctx.metadata().get("/f").unwrap();
        assert!(m.mtime > 0);
    }

    #[test]
    fn test_inconsistent_geometry_answers_invalid_argument() {
        let (_dir, ctx) = local_ctx(4);

        // total_size 5はチャンク0..=2 (チャンクサイズ4) の末尾区間に届かない
        assert_eq!(
            handle(
                &ctx,
                Request::ReadChunkRange {
                    identity: "/f".to_string(),
                    chunk_start: 0,
                    chunk_end: 2,
                    offset: 0,
                    total_size: 5,
                }
            )
            .unwrap_err(),
            ErrorCode::InvalidArgument
        );

        // 逆に末尾チャンクを超える組も弾く
        assert_eq!(
            handle(
                &ctx,
                Request::WriteChunkRange {
                    identity: "/f".to_string(),
                    chunk_start: 0,
                    chunk_end: 2,
                    offset: 0,
                    total_size: 20,
                    data: vec![0u8; 20],
                }
            )
            .unwrap_err(),
            ErrorCode::InvalidArgument
        );

        // 空転送とオーバーフロー境界
        for (offset, total_size) in [(0, 0), (3, u64::MAX)] {
            assert_eq!(
                handle(
                    &ctx,
                    Request::ReadChunkRange {
                        identity: "/f".to_string(),
                        chunk_start: 0,
                        chunk_end: 1,
                        offset,
                        total_size,
                    }
                )
                .unwrap_err(),
                ErrorCode::InvalidArgument
            );
        }
    }

    #[test]
    fn test_write_payload_length_mismatch_rejected() {
        let (_dir, ctx) = local_ctx(4);
        assert_eq!(
            handle(
                &ctx,
                Request::WriteChunkRange {
                    identity: "/f".to_string(),
                    chunk_start: 0,
                    chunk_end: 2,
                    offset: 0,
                    total_size: 10,
                    data: b"short".to_vec(),
                }
            )
            .unwrap_err(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_truncate_chunk_range_boundary_and_trim() {
        let (_dir, ctx) = local_ctx(4);
        handle(
            &ctx,
            Request::WriteChunkRange {
                identity: "/f".to_string(),
                chunk_start: 0,
                chunk_end: 2,
                offset: 0,
                total_size: 10,
                data: b"0123456789".to_vec(),
            },
        )
        .unwrap();

        // 10 → 3: チャンク0を3バイトに切り詰め、チャンク1以降を破棄
        handle(
            &ctx,
            Request::TruncateChunkRange {
                identity: "/f".to_string(),
                new_size: 3,
            },
        )
        .unwrap();

        let resp = handle(
            &ctx,
            Request::ReadChunkRange {
                identity: "/f".to_string(),
                chunk_start: 0,
                chunk_end: 2,
                offset: 0,
                total_size: 10,
            },
        )
        .unwrap();
        let Response::Read { segments } = resp else {
            panic!("wrong variant");
        };
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].chunk_index, 0);
        assert_eq!(segments[0].data, b"012");
    }

    #[test]
    fn test_rename_within_peer() {
        let (_dir, ctx) = local_ctx(4);
        create_file(&ctx, "/old");
        let m = ctx.metadata().get("/old").unwrap();

        handle(
            &ctx,
            Request::UpdateAttributes {
                old_key: "/old".to_string(),
                new_key: "/new".to_string(),
                metadata: m.serialize().unwrap(),
            },
        )
        .unwrap();
        assert!(!ctx.metadata().exists("/old"));
        assert!(ctx.metadata().exists("/new"));
    }

    #[test]
    fn test_chunk_stat_reports_configured_chunk_size() {
        let (_dir, ctx) = local_ctx(4096);
        let Response::Stat { stat } = handle(&ctx, Request::ChunkStat).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(stat.chunk_size, 4096);
    }
}
