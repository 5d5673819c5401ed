//! 上传环形缓冲区分配器
//!
//! 从一块持久映射的上传堆缓冲区中切出临时内存（常量数据、顶点数据、纹理上传）。
//! 分配时先回收已完成的区块，放不下就回绕到开头，仍然放不下则阻塞等待最早提交的区块。
//!
//! 非线程安全：一个分配器实例只能被一个线程使用。

use std::ptr::NonNull;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::error::{Result, RhiError};
use crate::rhi_ensure;

use super::command::ContextId;
use super::ring::{RetireError, RingCursor};
use super::sync::SyncPoint;

/// 默认对齐（D3D12 常量缓冲区视图要求 256 字节）
pub const DEFAULT_ALIGNMENT: u64 = 256;

/// 持久映射的内存区域
#[derive(Debug, Clone, Copy)]
pub struct MappedMemory {
    ptr: NonNull<u8>,
    len: u64,
}

impl MappedMemory {
    /// # Safety
    ///
    /// `ptr` 必须指向至少 `len` 字节的可写映射内存，并在分配器存活期间保持有效。
    pub unsafe fn new(ptr: NonNull<u8>, len: u64) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// 映射指针只在拥有分配器的线程上使用
unsafe impl Send for MappedMemory {}

/// 一次环形缓冲区分配
#[derive(Debug, Clone)]
pub struct RingAllocation {
    pub offset: u64,
    pub size: u64,
    /// CPU 可写地址（后端没有映射内存时为 `None`）
    pub mapped: Option<NonNull<u8>>,
    /// GPU 虚拟地址，Vulkan 后端为缓冲区内偏移
    pub gpu_address: u64,
    pub owner: Option<ContextId>,
}

impl RingAllocation {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// 环形缓冲区统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingBufferStats {
    pub capacity: u64,
    pub used: u64,
    pub live_blocks: usize,
    pub wrap_count: u64,
    pub stall_count: u64,
}

/// 上传环形缓冲区分配器
pub struct RingBufferAllocator {
    cursor: RingCursor,
    alignment: u64,
    mapped: Option<MappedMemory>,
    gpu_base: u64,
    wait_timeout: Option<Duration>,
    stall_count: u64,
}

impl RingBufferAllocator {
    /// 创建分配器
    ///
    /// `alignment` 必须是 2 的幂，`capacity` 不能为 0。
    pub fn new(capacity: u64, alignment: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(RhiError::AllocationTooLarge {
                requested: 0,
                capacity: 0,
            });
        }
        if !alignment.is_power_of_two() {
            return Err(RhiError::ContractViolation(format!(
                "ring buffer alignment {} is not a power of two",
                alignment
            )));
        }

        Ok(Self {
            cursor: RingCursor::new(capacity),
            alignment,
            mapped: None,
            gpu_base: 0,
            wait_timeout: None,
            stall_count: 0,
        })
    }

    /// 绑定后端缓冲区的映射内存和 GPU 基址
    pub fn with_memory(mut self, mapped: Option<MappedMemory>, gpu_base: u64) -> Self {
        self.mapped = mapped;
        self.gpu_base = gpu_base;
        self
    }

    /// 背压等待的超时
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn capacity(&self) -> u64 {
        self.cursor.capacity()
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// 当前写入位置
    pub fn current_offset(&self) -> u64 {
        self.cursor.head()
    }

    pub fn stats(&self) -> RingBufferStats {
        RingBufferStats {
            capacity: self.cursor.capacity(),
            used: self.cursor.used(),
            live_blocks: self.cursor.live_blocks(),
            wrap_count: self.cursor.wrap_count(),
            stall_count: self.stall_count,
        }
    }

    /// 按默认对齐分配
    pub fn allocate(&mut self, size: u64) -> Result<RingAllocation> {
        self.allocate_aligned(size, self.alignment)
    }

    /// 分配 `size` 字节
    ///
    /// 超过总容量时返回错误；暂时放不下时阻塞等待队首区块完成，队首仍在使用时返回 `RingBufferExhausted`。
    pub fn allocate_aligned(&mut self, size: u64, alignment: u64) -> Result<RingAllocation> {
        let capacity = self.cursor.capacity();
        if size > capacity {
            return Err(RhiError::AllocationTooLarge {
                requested: size,
                capacity,
            });
        }
        let alignment = alignment.max(self.alignment);
        let size = size.max(1);

        loop {
            self.cursor.reclaim();
            if let Some(offset) = self.cursor.try_allocate(size, alignment) {
                return Ok(self.make_allocation(offset, size));
            }

            let Some(pending) = self.cursor.oldest_pending() else {
                return Err(RhiError::RingBufferExhausted { requested: size });
            };
            self.stall_count += 1;
            warn!(
                requested = size,
                used = self.cursor.used(),
                capacity,
                fence = %pending.value(),
                "Upload ring buffer full, stalling on GPU fence"
            );
            pending.wait(self.wait_timeout)?;
        }
    }

    /// 释放分配，`sync` 完成后内存才会被复用
    pub fn free(&mut self, allocation: &RingAllocation, sync: SyncPoint) {
        match self.cursor.retire(allocation.offset, sync) {
            Ok(()) => debug!(offset = allocation.offset, size = allocation.size, "Ring allocation retired"),
            Err(RetireError::AlreadyRetired) => {
                rhi_ensure!(false, "ring allocation at offset {} freed twice", allocation.offset);
            }
            Err(RetireError::UnknownBlock) => {
                rhi_ensure!(false, "ring allocation at offset {} is not live", allocation.offset);
            }
        }
    }

    /// 把 POD 数据写入分配的映射内存
    ///
    /// `offset` 是分配内的字节偏移。
    pub fn write<T: bytemuck::Pod>(&self, allocation: &RingAllocation, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = bytes.len() as u64;
        if offset + len > allocation.size {
            return Err(RhiError::ContractViolation(format!(
                "write of {} bytes at offset {} overflows ring allocation of {} bytes",
                len, offset, allocation.size
            )));
        }
        let Some(base) = allocation.mapped else {
            return Err(RhiError::ContractViolation(
                "ring allocation has no CPU mapping".to_string(),
            ));
        };
        // SAFETY: 分配区间在映射内存范围内，且写入范围已检查不越过分配大小
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.as_ptr().add(offset as usize), bytes.len());
        }
        Ok(())
    }

    fn make_allocation(&self, offset: u64, size: u64) -> RingAllocation {
        let mapped = self.mapped.and_then(|m| {
            debug_assert!(offset + size <= m.len);
            // SAFETY: offset 小于容量，容量不超过映射长度
            NonNull::new(unsafe { m.ptr.as_ptr().add(offset as usize) })
        });
        RingAllocation {
            offset,
            size,
            mapped,
            gpu_address: self.gpu_base + offset,
            owner: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::sync::{FenceValue, SoftwareFence};
    use std::sync::Arc;
    use std::thread;

    fn point(fence: &Arc<SoftwareFence>, value: u64) -> SyncPoint {
        SyncPoint::new(fence.clone(), FenceValue::new(value))
    }

    #[test]
    fn test_allocate_too_large() {
        let mut ring = RingBufferAllocator::new(1024, 256).unwrap();
        assert!(matches!(
            ring.allocate(2048),
            Err(RhiError::AllocationTooLarge { requested: 2048, capacity: 1024 })
        ));
    }

    #[test]
    fn test_invalid_alignment() {
        assert!(RingBufferAllocator::new(1024, 100).is_err());
        assert!(RingBufferAllocator::new(0, 256).is_err());
    }

    #[test]
    fn test_gpu_address() {
        let mut ring = RingBufferAllocator::new(1024, 256).unwrap().with_memory(None, 0x1_0000);
        let a = ring.allocate(16).unwrap();
        let b = ring.allocate(16).unwrap();
        assert_eq!(a.gpu_address, 0x1_0000);
        assert_eq!(b.gpu_address, 0x1_0100);
        assert!(a.mapped.is_none());
    }

    #[test]
    fn test_wrap_without_overlap() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingBufferAllocator::new(1024, 256).unwrap();

        // 填满
        let allocations: Vec<_> = (0..4).map(|_| ring.allocate(256).unwrap()).collect();
        for (i, alloc) in allocations.iter().enumerate() {
            assert_eq!(alloc.offset, i as u64 * 256);
            ring.free(alloc, point(&fence, i as u64 + 1));
        }

        // 只完成前两个
        fence.signal(2);
        let wrapped = ring.allocate(512).unwrap();
        assert_eq!(wrapped.offset, 0);
        // 不与仍在使用的 [512, 1024) 重叠
        assert!(wrapped.end() <= allocations[2].offset);
        assert_eq!(ring.stats().wrap_count, 1);
    }

    #[test]
    fn test_blocks_until_fence_completes() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingBufferAllocator::new(512, 256)
            .unwrap()
            .with_wait_timeout(Some(Duration::from_secs(5)));

        let a = ring.allocate(512).unwrap();
        ring.free(&a, point(&fence, 1));

        let signaler = {
            let fence = fence.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                fence.signal(1);
            })
        };

        // 背压：等待栅栏 1 后复用
        let b = ring.allocate(256).unwrap();
        assert_eq!(b.offset, 0);
        assert_eq!(ring.stats().stall_count, 1);
        signaler.join().unwrap();
    }

    #[test]
    fn test_stall_timeout_is_device_lost() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingBufferAllocator::new(256, 256)
            .unwrap()
            .with_wait_timeout(Some(Duration::from_millis(5)));
        let a = ring.allocate(256).unwrap();
        ring.free(&a, point(&fence, 1));

        assert!(ring.allocate(256).unwrap_err().is_device_lost());
    }

    #[test]
    fn test_exhausted_without_pending_work() {
        let mut ring = RingBufferAllocator::new(256, 256).unwrap();
        let _a = ring.allocate(256).unwrap();
        assert!(matches!(
            ring.allocate(16),
            Err(RhiError::RingBufferExhausted { .. })
        ));
    }

    #[test]
    fn test_live_front_block_is_exhausted() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut ring = RingBufferAllocator::new(512, 256).unwrap();
        let _front = ring.allocate(256).unwrap();
        let back = ring.allocate(256).unwrap();
        ring.free(&back, point(&fence, 1));
        fence.signal(1);

        // 队首仍在使用，后面完成的区块无法回收，不能等待
        assert!(matches!(
            ring.allocate(256),
            Err(RhiError::RingBufferExhausted { requested: 256 })
        ));
        assert_eq!(ring.stats().stall_count, 0);
    }

    #[test]
    fn test_write_to_mapped_memory() {
        let mut backing = vec![0u8; 512];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let mapped = unsafe { MappedMemory::new(ptr, 512) };
        let mut ring = RingBufferAllocator::new(512, 256).unwrap().with_memory(Some(mapped), 0);

        let _first = ring.allocate(4).unwrap();
        let second = ring.allocate(8).unwrap();
        ring.write(&second, 0, &[1u32, 2u32]).unwrap();
        assert!(ring.write(&second, 4, &[1u32, 2u32]).is_err());

        assert_eq!(&backing[256..264], bytemuck::cast_slice::<u32, u8>(&[1, 2]));
    }
}
