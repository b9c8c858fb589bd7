//! メタデータレコードとビルド時スキーマ
//!
//! 1ファイルシステムオブジェクトにつき1レコード。どのオプションフィールドを
//! 持つかはcargoフィーチャで決まるビルド時スキーマで、デプロイメント内の
//! 全ピアが同一スキーマでビルドされている必要がある。シリアライズ形式は
//! フィールド順固定・`|` 区切りのテキストで、ワイヤとディスクの両方で
//! ビット単位の互換性を要求される。

use std::time::{SystemTime, UNIX_EPOCH};

/// フィールド区切り文字
pub const METADATA_SEPARATOR: char = '|';

/// ビルド時スキーマ。全ピアで一致していなければならない。
pub mod schema {
    pub const USE_ATIME: bool = cfg!(feature = "atime");
    pub const USE_MTIME: bool = cfg!(feature = "mtime");
    pub const USE_CTIME: bool = cfg!(feature = "ctime");
    pub const USE_UID_GID: bool = cfg!(feature = "uid-gid");
    pub const USE_INODE: bool = cfg!(feature = "inode");
    pub const USE_LINK_COUNT: bool = cfg!(feature = "link-count");
    pub const USE_BLOCKS: bool = cfg!(feature = "blocks");
    pub const USE_SYMLINKS: bool = cfg!(feature = "symlinks");
}

/// オブジェクト種別。modeフィールドのファイルタイプビットにエンコードされる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(FileKind::Regular),
            S_IFDIR => Some(FileKind::Directory),
            S_IFLNK => Some(FileKind::Symlink),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Regular => S_IFREG,
            FileKind::Directory => S_IFDIR,
            FileKind::Symlink => S_IFLNK,
        }
    }
}

/// シリアライズ/デシリアライズ失敗
#[derive(Debug, thiserror::Error)]
pub enum MetadataFormatError {
    #[error("Malformed metadata value: {0}")]
    Malformed(String),

    #[error("Symlink target must be absolute: {0}")]
    RelativeLinkTarget(String),

    #[error("Symlink target on non-symlink object")]
    UnexpectedLinkTarget,
}

/// ファイルシステムオブジェクトのメタデータレコード
///
/// sizeは通常ファイルに対してのみ権威的。無効化されたフィールドも構造体
/// 上は存在するが、シリアライズされず、等価比較でも無視される。
#[derive(Debug, Clone)]
pub struct Metadata {
    /// POSIX modeフィールド (種別ビット + パーミッション)
    pub mode: u32,
    /// バイトサイズ
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
    pub link_count: u64,
    /// 割り当てブロック数
    pub blocks: u64,
    /// シンボリックリンクターゲット (絶対パス、symlinkのみ)
    pub target: Option<String>,
}

impl Metadata {
    /// 指定modeの空レコードを作成する
    pub fn new(mode: u32) -> Self {
        Self {
            mode,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            uid: 0,
            gid: 0,
            inode: 0,
            link_count: 0,
            blocks: 0,
            target: None,
        }
    }

    pub fn new_regular(perm: u32) -> Self {
        Self::new(FileKind::Regular.type_bits() | (perm & !S_IFMT))
    }

    pub fn new_directory(perm: u32) -> Self {
        Self::new(FileKind::Directory.type_bits() | (perm & !S_IFMT))
    }

    pub fn new_symlink(perm: u32, target: String) -> Self {
        let mut m = Self::new(FileKind::Symlink.type_bits() | (perm & !S_IFMT));
        m.target = Some(target);
        m
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == Some(FileKind::Directory)
    }

    pub fn is_regular(&self) -> bool {
        self.kind() == Some(FileKind::Regular)
    }

    /// atime/mtime/ctimeを現在時刻で初期化する
    pub fn init_times(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.atime = now;
        self.mtime = now;
        self.ctime = now;
    }

    /// フィールド順固定のテキスト形式にシリアライズする。
    /// 順序が互換性を決めるので変更してはならない。
    pub fn serialize(&self) -> Result<String, MetadataFormatError> {
        if self.target.is_some() && self.kind() != Some(FileKind::Symlink) {
            return Err(MetadataFormatError::UnexpectedLinkTarget);
        }

        let mut s = String::new();
        s.push_str(&self.mode.to_string());
        s.push(METADATA_SEPARATOR);
        s.push_str(&self.size.to_string());
        if schema::USE_ATIME {
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.atime.to_string());
        }
        if schema::USE_MTIME {
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.mtime.to_string());
        }
        if schema::USE_CTIME {
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.ctime.to_string());
        }
        if schema::USE_UID_GID {
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.uid.to_string());
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.gid.to_string());
        }
        if schema::USE_INODE {
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.inode.to_string());
        }
        if schema::USE_LINK_COUNT {
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.link_count.to_string());
        }
        if schema::USE_BLOCKS {
            s.push(METADATA_SEPARATOR);
            s.push_str(&self.blocks.to_string());
        }
        if schema::USE_SYMLINKS {
            if let Some(target) = &self.target {
                if !target.starts_with('/') {
                    return Err(MetadataFormatError::RelativeLinkTarget(target.clone()));
                }
                s.push(METADATA_SEPARATOR);
                s.push_str(target);
            }
        }
        Ok(s)
    }

    /// serialize()の逆変換。スキーマ外のフィールドはゼロのまま残る。
    pub fn deserialize(value: &str) -> Result<Self, MetadataFormatError> {
        let mut fields = value.split(METADATA_SEPARATOR);
        let mut next = |name: &str| {
            fields
                .next()
                .ok_or_else(|| MetadataFormatError::Malformed(format!("missing field: {}", name)))
        };
        let parse_err =
            |name: &str| MetadataFormatError::Malformed(format!("unparsable field: {}", name));

        let mut m = Metadata::new(0);
        m.mode = next("mode")?.parse().map_err(|_| parse_err("mode"))?;
        m.size = next("size")?.parse().map_err(|_| parse_err("size"))?;
        if schema::USE_ATIME {
            m.atime = next("atime")?.parse().map_err(|_| parse_err("atime"))?;
        }
        if schema::USE_MTIME {
            m.mtime = next("mtime")?.parse().map_err(|_| parse_err("mtime"))?;
        }
        if schema::USE_CTIME {
            m.ctime = next("ctime")?.parse().map_err(|_| parse_err("ctime"))?;
        }
        if schema::USE_UID_GID {
            m.uid = next("uid")?.parse().map_err(|_| parse_err("uid"))?;
            m.gid = next("gid")?.parse().map_err(|_| parse_err("gid"))?;
        }
        if schema::USE_INODE {
            m.inode = next("inode")?.parse().map_err(|_| parse_err("inode"))?;
        }
        if schema::USE_LINK_COUNT {
            m.link_count = next("link_count")?
                .parse()
                .map_err(|_| parse_err("link_count"))?;
        }
        if schema::USE_BLOCKS {
            m.blocks = next("blocks")?.parse().map_err(|_| parse_err("blocks"))?;
        }
        if schema::USE_SYMLINKS {
            if let Some(target) = fields.next() {
                if FileKind::from_mode(m.mode) != Some(FileKind::Symlink) {
                    return Err(MetadataFormatError::UnexpectedLinkTarget);
                }
                if !target.starts_with('/') {
                    return Err(MetadataFormatError::RelativeLinkTarget(target.to_string()));
                }
                m.target = Some(target.to_string());
                return Ok(m);
            }
        }
        if fields.next().is_some() {
            return Err(MetadataFormatError::Malformed(
                "trailing fields beyond schema".to_string(),
            ));
        }
        Ok(m)
    }
}

/// 有効なフィールドだけを比較する。スキーマ外のフィールドは
/// ラウンドトリップで保存されないため、等価性にも含めない。
impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        if self.mode != other.mode || self.size != other.size {
            return false;
        }
        if schema::USE_ATIME && self.atime != other.atime {
            return false;
        }
        if schema::USE_MTIME && self.mtime != other.mtime {
            return false;
        }
        if schema::USE_CTIME && self.ctime != other.ctime {
            return false;
        }
        if schema::USE_UID_GID && (self.uid != other.uid || self.gid != other.gid) {
            return false;
        }
        if schema::USE_INODE && self.inode != other.inode {
            return false;
        }
        if schema::USE_LINK_COUNT && self.link_count != other.link_count {
            return false;
        }
        if schema::USE_BLOCKS && self.blocks != other.blocks {
            return false;
        }
        if schema::USE_SYMLINKS && self.target != other.target {
            return false;
        }
        true
    }
}

impl Eq for Metadata {}
