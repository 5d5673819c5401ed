//! 环形区间游标
//!
//! 上传环形缓冲区（字节）和描述符堆的临时区（描述符槽位）共用的区间管理。
//! 区块按分配顺序排队；区块被释放时记录一个 [`SyncPoint`]，
//! 只有队首的区块在同步点完成后才会被回收，因此乱序释放也不会提前复用内存。
//!
//! 非线程安全，由拥有者外部同步。

use std::collections::VecDeque;

use super::sync::SyncPoint;

/// 对齐到 `alignment`（必须是 2 的幂）
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Debug)]
struct Block {
    offset: u64,
    size: u64,
    /// 本区块之前被跳过的字节（对齐或回绕造成）
    padding: u64,
    retired: Option<SyncPoint>,
}

/// 释放区块时的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireError {
    /// 没有从该偏移开始的存活区块
    UnknownBlock,
    /// 区块已经被释放过
    AlreadyRetired,
}

/// 环形区间游标
#[derive(Debug)]
pub struct RingCursor {
    capacity: u64,
    head: u64,
    tail: u64,
    used: u64,
    blocks: VecDeque<Block>,
    wrap_count: u64,
}

impl RingCursor {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            head: 0,
            tail: 0,
            used: 0,
            blocks: VecDeque::new(),
            wrap_count: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// 下一次分配的起始位置
    pub fn head(&self) -> u64 {
        self.head
    }

    /// 已占用的单位数（含对齐与回绕浪费）
    pub fn used(&self) -> u64 {
        self.used
    }

    /// 已回绕的次数
    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }

    /// 尚未回收的区块数
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// 回收队首所有已完成的区块
    ///
    /// 遇到第一个未释放或未完成的区块即停止。返回回收的区块数。
    pub fn reclaim(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Some(front) = self.blocks.front() {
            let done = front.retired.as_ref().map_or(false, SyncPoint::is_complete);
            if !done {
                break;
            }
            if let Some(block) = self.blocks.pop_front() {
                self.tail = block.offset + block.size;
                self.used -= block.padding + block.size;
                reclaimed += 1;
            }
        }
        if self.blocks.is_empty() {
            self.head = 0;
            self.tail = 0;
            self.used = 0;
        }
        reclaimed
    }

    /// 尝试分配一段连续区间，放不下时返回 `None`
    pub fn try_allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        if size == 0 || size > self.capacity {
            return None;
        }
        if self.used == 0 {
            self.head = 0;
            self.tail = 0;
        }

        let wrapped = self.used > 0 && self.head <= self.tail;
        let aligned = align_up(self.head, alignment);

        let (offset, padding) = if wrapped {
            // 存活区间是 [tail, capacity) 加 [0, head)，空闲区间是 [head, tail)
            if aligned + size <= self.tail {
                (aligned, aligned - self.head)
            } else {
                return None;
            }
        } else if aligned + size <= self.capacity {
            (aligned, aligned - self.head)
        } else if size <= self.tail {
            // 回绕到开头，末尾剩余空间计入本区块
            self.wrap_count += 1;
            (0, self.capacity - self.head)
        } else {
            return None;
        };

        self.blocks.push_back(Block {
            offset,
            size,
            padding,
            retired: None,
        });
        self.used += padding + size;
        self.head = offset + size;
        Some(offset)
    }

    /// 释放从 `offset` 开始的区块，`sync` 完成后才可复用
    pub fn retire(&mut self, offset: u64, sync: SyncPoint) -> Result<(), RetireError> {
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.offset == offset)
            .ok_or(RetireError::UnknownBlock)?;
        if block.retired.is_some() {
            return Err(RetireError::AlreadyRetired);
        }
        block.retired = Some(sync);
        Ok(())
    }

    /// 队首区块的同步点
    ///
    /// 回收只从队首进行，队首仍在使用时返回 `None`，后面的区块即使已完成也无法腾出空间。
    pub fn oldest_pending(&self) -> Option<SyncPoint> {
        self.blocks.front().and_then(|b| b.retired.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::sync::{FenceValue, SoftwareFence};
    use std::sync::Arc;

    fn point(fence: &Arc<SoftwareFence>, value: u64) -> SyncPoint {
        SyncPoint::new(fence.clone(), FenceValue::new(value))
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 4), 260);
    }

    #[test]
    fn test_sequential_allocation() {
        let mut ring = RingCursor::new(100);
        assert_eq!(ring.try_allocate(30, 1), Some(0));
        assert_eq!(ring.try_allocate(30, 1), Some(30));
        assert_eq!(ring.try_allocate(30, 1), Some(60));
        assert_eq!(ring.try_allocate(30, 1), None);
        assert_eq!(ring.used(), 90);
    }

    #[test]
    fn test_wrap_after_reclaim() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingCursor::new(100);
        let a = ring.try_allocate(40, 1).unwrap();
        let b = ring.try_allocate(40, 1).unwrap();

        ring.retire(a, point(&fence, 1)).unwrap();
        ring.retire(b, point(&fence, 2)).unwrap();

        // 栅栏未完成，无法回绕
        assert_eq!(ring.try_allocate(30, 1), None);

        fence.signal(1);
        ring.reclaim();
        // a 已回收，回绕到 0；b 仍然占用 [40, 80)
        assert_eq!(ring.try_allocate(30, 1), Some(0));
        assert_eq!(ring.wrap_count(), 1);
        // [30, 40) 只剩 10
        assert_eq!(ring.try_allocate(20, 1), None);
    }

    #[test]
    fn test_out_of_order_retire_waits_for_front() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingCursor::new(100);
        let a = ring.try_allocate(50, 1).unwrap();
        let b = ring.try_allocate(50, 1).unwrap();

        // 后分配的先释放并完成
        ring.retire(b, point(&fence, 1)).unwrap();
        fence.signal(1);
        assert_eq!(ring.reclaim(), 0);
        assert_eq!(ring.try_allocate(10, 1), None);

        assert!(ring.oldest_pending().is_none());

        ring.retire(a, point(&fence, 2)).unwrap();
        assert_eq!(ring.oldest_pending().map(|p| p.value().value()), Some(2));
        fence.signal(2);
        assert_eq!(ring.reclaim(), 2);
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.try_allocate(100, 1), Some(0));
    }

    #[test]
    fn test_alignment_padding() {
        let mut ring = RingCursor::new(1024);
        assert_eq!(ring.try_allocate(10, 256), Some(0));
        assert_eq!(ring.try_allocate(10, 256), Some(256));
        assert_eq!(ring.used(), 256 + 10);
    }

    #[test]
    fn test_retire_errors() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingCursor::new(64);
        let a = ring.try_allocate(8, 1).unwrap();
        assert_eq!(ring.retire(32, point(&fence, 1)), Err(RetireError::UnknownBlock));
        ring.retire(a, point(&fence, 1)).unwrap();
        assert_eq!(ring.retire(a, point(&fence, 1)), Err(RetireError::AlreadyRetired));
    }

    #[test]
    fn test_full_ring_with_head_equal_tail() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingCursor::new(100);
        let a = ring.try_allocate(50, 1).unwrap();
        let b = ring.try_allocate(50, 1).unwrap();
        ring.retire(a, point(&fence, 1)).unwrap();
        fence.signal(1);
        ring.reclaim();

        // 回绕后正好填满，head == tail == 50
        assert_eq!(ring.try_allocate(50, 1), Some(0));
        assert_eq!(ring.try_allocate(1, 1), None);

        ring.retire(b, point(&fence, 2)).unwrap();
        fence.signal(2);
        ring.reclaim();
        assert_eq!(ring.try_allocate(50, 1), Some(50));
    }
}
