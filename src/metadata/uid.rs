//! スロット分割式の識別子アロケータ
//!
//! u64空間をピア数で等分し、各ピアは自分のスロット範囲からのみ識別子を
//! 払い出す。調整通信なしでデプロイメント全体の一意性が成り立つ。

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum UidError {
    #[error("Slot count must be non-zero")]
    ZeroSlots,

    #[error("Slot {slot} out of range for {slot_count} slot(s)")]
    SlotOutOfRange { slot: u64, slot_count: u64 },

    #[error("Local uid range exhausted")]
    Overflow,
}

pub type UidResult<T> = Result<T, UidError>;

/// ロックフリーの識別子アロケータ
///
/// `generate()` はCASリトライループで、インクリメント前に上限を検査する。
/// 範囲を使い切ったらカウンタをラップさせずにOverflowを返す。
pub struct UidAllocator {
    next: AtomicU64,
    /// 排他的上限
    end: u64,
}

impl UidAllocator {
    /// u64空間を `slot_count` 等分したうちの `my_slot` 番目の範囲を持つ
    /// アロケータを作る。最終スロットは端数も受け持つ。
    pub fn new(slot_count: u64, my_slot: u64) -> UidResult<Self> {
        if slot_count == 0 {
            return Err(UidError::ZeroSlots);
        }
        if my_slot >= slot_count {
            return Err(UidError::SlotOutOfRange {
                slot: my_slot,
                slot_count,
            });
        }
        let width = u64::MAX / slot_count;
        let start = my_slot * width;
        let end = if my_slot == slot_count - 1 {
            u64::MAX
        } else {
            start + width
        };
        Ok(Self {
            next: AtomicU64::new(start),
            end,
        })
    }

    /// 開始値と払い出し可能数を直接指定する (枯渇テスト用)。
    pub fn with_capacity(start: u64, capacity: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            end: start + capacity,
        }
    }

    /// 次の識別子を払い出す。
    pub fn generate(&self) -> UidResult<u64> {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            if current >= self.end {
                return Err(UidError::Overflow);
            }
            match self.next.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current),
                Err(_) => continue,
            }
        }
    }
}
