//! サイズ会計用マージオペランド
//!
//! 同一パスへの並行サイズ更新をロックなしで正しく畳み込むための
//! オペランド定義。RPCハンドラスレッドはread-modify-writeをせず、
//! 小さなオペランドをKVエンジンに積むだけで、衝突の解決はエンジンの
//! キー単位逐次リコンサイルに委ねられる。
//!
//! ワイヤ/ディスク形式は先頭1バイトのタグ + タグごとの固定ペイロード:
//! - `i` (increase): 8バイトLEサイズ + 1バイトappendフラグ
//! - `d` (decrease): 8バイトLEサイズ
//! - `c` (create):   シリアライズ済みMetadata
//!
//! デプロイメント内の全ピアでビット単位に一致していなければならない。

use crate::kv::MergeOperator;
use crate::metadata::types::Metadata;

const TAG_INCREASE: u8 = b'i';
const TAG_DECREASE: u8 = b'd';
const TAG_CREATE: u8 = b'c';

/// オペランドのデコード失敗
#[derive(Debug, thiserror::Error)]
pub enum OperandError {
    #[error("Empty operand")]
    Empty,

    #[error("Unknown operand tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Truncated operand payload for tag {tag:?}: {len} bytes")]
    TruncatedPayload { tag: char, len: usize },
}

/// サイズ会計オペランド (閉じたバリアント集合)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOperand {
    /// appendなら `size += delta`、そうでなければ `size = max(size, bound)`
    /// (boundは書き込みが生み得た最大オフセット `offset + length`)
    IncreaseSize { size: u64, append: bool },
    /// `size = min(size, new_size)` (truncate用の切り下げ)
    DecreaseSize { size: u64 },
    /// 完全値の設置。delete後のcreateレースでもチェーンに合成できる。
    Create { value: Vec<u8> },
}

impl MergeOperand {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MergeOperand::IncreaseSize { size, append } => {
                let mut buf = Vec::with_capacity(10);
                buf.push(TAG_INCREASE);
                buf.extend_from_slice(&size.to_le_bytes());
                buf.push(u8::from(*append));
                buf
            }
            MergeOperand::DecreaseSize { size } => {
                let mut buf = Vec::with_capacity(9);
                buf.push(TAG_DECREASE);
                buf.extend_from_slice(&size.to_le_bytes());
                buf
            }
            MergeOperand::Create { value } => {
                let mut buf = Vec::with_capacity(1 + value.len());
                buf.push(TAG_CREATE);
                buf.extend_from_slice(value);
                buf
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OperandError> {
        let (&tag, payload) = bytes.split_first().ok_or(OperandError::Empty)?;
        match tag {
            TAG_INCREASE => {
                if payload.len() != 9 {
                    return Err(OperandError::TruncatedPayload {
                        tag: 'i',
                        len: payload.len(),
                    });
                }
                let size = u64::from_le_bytes(payload[..8].try_into().expect("checked length"));
                Ok(MergeOperand::IncreaseSize {
                    size,
                    append: payload[8] != 0,
                })
            }
            TAG_DECREASE => {
                if payload.len() != 8 {
                    return Err(OperandError::TruncatedPayload {
                        tag: 'd',
                        len: payload.len(),
                    });
                }
                let size = u64::from_le_bytes(payload.try_into().expect("checked length"));
                Ok(MergeOperand::DecreaseSize { size })
            }
            TAG_CREATE => Ok(MergeOperand::Create {
                value: payload.to_vec(),
            }),
            other => Err(OperandError::UnknownTag(other)),
        }
    }
}

/// メタデータ値に対するマージオペレータ
///
/// オペランドは投入順に適用される。基底値がない場合、チェーン先頭より
/// 前のincrease/decreaseは適用先がないため畳み込み失敗になる
/// (createがチェーンのどこかで値を設置すればそこから先は畳める)。
pub struct MetadataMergeOperator;

impl MergeOperator for MetadataMergeOperator {
    fn full_merge(
        &self,
        key: &[u8],
        existing: Option<&[u8]>,
        operands: &[Vec<u8>],
    ) -> Option<Vec<u8>> {
        let mut current: Option<Metadata> = match existing {
            Some(bytes) => match std::str::from_utf8(bytes).ok().map(Metadata::deserialize) {
                Some(Ok(m)) => Some(m),
                _ => {
                    tracing::error!(
                        "Undecodable base metadata value for key {:?}",
                        String::from_utf8_lossy(key)
                    );
                    return None;
                }
            },
            None => None,
        };

        for raw in operands {
            let operand = match MergeOperand::decode(raw) {
                Ok(op) => op,
                Err(e) => {
                    tracing::error!("Undecodable merge operand: {}", e);
                    return None;
                }
            };
            match operand {
                MergeOperand::Create { value } => {
                    let text = std::str::from_utf8(&value).ok()?;
                    current = Some(Metadata::deserialize(text).ok()?);
                }
                MergeOperand::IncreaseSize { size, append } => {
                    let m = current.as_mut()?;
                    if append {
                        m.size += size;
                    } else {
                        m.size = m.size.max(size);
                    }
                }
                MergeOperand::DecreaseSize { size } => {
                    let m = current.as_mut()?;
                    m.size = m.size.min(size);
                }
            }
        }

        let merged = current?;
        merged.serialize().ok().map(String::into_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(existing: Option<&Metadata>, ops: &[MergeOperand]) -> Option<Metadata> {
        let base = existing.map(|m| m.serialize().unwrap().into_bytes());
        let encoded: Vec<Vec<u8>> = ops.iter().map(|op| op.encode()).collect();
        MetadataMergeOperator
            .full_merge(b"/f", base.as_deref(), &encoded)
            .map(|v| Metadata::deserialize(std::str::from_utf8(&v).unwrap()).unwrap())
    }

    #[test]
    fn test_operand_encoding_round_trip() {
        for op in [
            MergeOperand::IncreaseSize {
                size: 0xDEAD_BEEF,
                append: true,
            },
            MergeOperand::IncreaseSize {
                size: 0,
                append: false,
            },
            MergeOperand::DecreaseSize { size: u64::MAX },
            MergeOperand::Create {
                value: b"100644|0".to_vec(),
            },
        ] {
            assert_eq!(MergeOperand::decode(&op.encode()).unwrap(), op);
        }
    }

    #[test]
    fn test_operand_tag_byte_is_leading() {
        let op = MergeOperand::DecreaseSize { size: 3 };
        assert_eq!(op.encode()[0], b'd');
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            MergeOperand::decode(&[]),
            Err(OperandError::Empty)
        ));
        assert!(matches!(
            MergeOperand::decode(&[b'x', 1, 2]),
            Err(OperandError::UnknownTag(_))
        ));
        assert!(matches!(
            MergeOperand::decode(&[b'i', 1, 2]),
            Err(OperandError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_non_append_takes_high_water_mark() {
        let mut base = Metadata::new_regular(0o644);
        base.size = 100;
        let out = fold(
            Some(&base),
            &[
                MergeOperand::IncreaseSize {
                    size: 50,
                    append: false,
                },
                MergeOperand::IncreaseSize {
                    size: 180,
                    append: false,
                },
            ],
        )
        .unwrap();
        assert_eq!(out.size, 180);
    }

    #[test]
    fn test_append_accumulates_in_order() {
        let base = Metadata::new_regular(0o644);
        let out = fold(
            Some(&base),
            &[
                MergeOperand::IncreaseSize {
                    size: 5,
                    append: true,
                },
                MergeOperand::IncreaseSize {
                    size: 5,
                    append: true,
                },
            ],
        )
        .unwrap();
        assert_eq!(out.size, 10);
    }

    #[test]
    fn test_decrease_clamps_down_only() {
        let mut base = Metadata::new_regular(0o644);
        base.size = 10;
        let out = fold(Some(&base), &[MergeOperand::DecreaseSize { size: 3 }]).unwrap();
        assert_eq!(out.size, 3);

        // 既に小さければ変わらない
        let out = fold(Some(&base), &[MergeOperand::DecreaseSize { size: 30 }]).unwrap();
        assert_eq!(out.size, 10);
    }

    #[test]
    fn test_create_installs_value_without_base() {
        let mut m = Metadata::new_regular(0o644);
        m.size = 7;
        let out = fold(
            None,
            &[MergeOperand::Create {
                value: m.serialize().unwrap().into_bytes(),
            }],
        )
        .unwrap();
        assert_eq!(out, m);
    }

    #[test]
    fn test_create_then_increase_composes() {
        let m = Metadata::new_regular(0o644);
        let out = fold(
            None,
            &[
                MergeOperand::Create {
                    value: m.serialize().unwrap().into_bytes(),
                },
                MergeOperand::IncreaseSize {
                    size: 42,
                    append: false,
                },
            ],
        )
        .unwrap();
        assert_eq!(out.size, 42);
    }

    #[test]
    fn test_increase_without_base_fails() {
        assert!(fold(
            None,
            &[MergeOperand::IncreaseSize {
                size: 1,
                append: false
            }]
        )
        .is_none());
    }

    #[test]
    fn test_truncate_racing_write_is_last_merged_wins() {
        let mut base = Metadata::new_regular(0o644);
        base.size = 100;
        // truncate(10) の後に非appendの書き込み境界90が並んだ場合、
        // オペランド順で後勝ちになる (受容済みの弱一貫性エッジ)
        let out = fold(
            Some(&base),
            &[
                MergeOperand::DecreaseSize { size: 10 },
                MergeOperand::IncreaseSize {
                    size: 90,
                    append: false,
                },
            ],
        )
        .unwrap();
        assert_eq!(out.size, 90);
    }
}
