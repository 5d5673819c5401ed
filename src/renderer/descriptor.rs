//! 描述符管理模块
//!
//! 每种描述符堆类型一个固定容量的堆，分为两个区域：
//!
//! ```text
//! [0, persistent)                        持久区：纹理 / 缓冲区视图，显式释放，立即复用
//! [persistent, persistent + temporary)   临时区：每次绘制 / 分派的内联描述符表，环形分配
//! ```
//!
//! 临时区的区块在提交后以队列栅栏值释放，栅栏完成前绝不复用。
//! 堆不会扩容：GPU 命令通过原始偏移引用描述符，重新分配会让已录制的命令失效，
//! 容量耗尽直接返回 [`RhiError::DescriptorHeapExhausted`]。
//!
//! 句柄地址：`heap_base + index * increment_size`，`increment_size` 在建堆时从后端查询一次。
//!
//! # DirectX 12 描述符类型
//!
//! - **RTV** (Render Target View)：渲染目标视图，用于渲染输出
//! - **DSV** (Depth Stencil View)：深度模板视图，用于深度测试
//! - **CBV** (Constant Buffer View)：常量缓冲视图，用于着色器常量
//! - **SRV** (Shader Resource View)：着色资源视图，用于着色器读取纹理/缓冲
//! - **UAV** (Unordered Access View)：无序访问视图，用于计算着色器读写
//!
//! Vulkan 后端用一个无绑定（bindless）描述符集模拟着色器可见的堆，数组下标即堆索引。

use std::collections::VecDeque;
use std::fmt;

use tracing::error;

use crate::core::config::{DescriptorConfig, HeapCapacity};
use crate::core::error::{Result, RhiError};
use crate::rhi_ensure;

use super::ring::{RetireError, RingCursor};
use super::sync::SyncPoint;

/// 描述符堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// CBV / SRV / UAV 混合堆
    CbvSrvUav,
    /// 采样器堆
    Sampler,
    /// 渲染目标视图堆
    Rtv,
    /// 深度模板视图堆
    Dsv,
}

impl DescriptorHeapType {
    pub const ALL: [DescriptorHeapType; 4] = [
        DescriptorHeapType::CbvSrvUav,
        DescriptorHeapType::Sampler,
        DescriptorHeapType::Rtv,
        DescriptorHeapType::Dsv,
    ];

    /// 在 `ALL` 中的下标
    pub fn index(self) -> usize {
        match self {
            DescriptorHeapType::CbvSrvUav => 0,
            DescriptorHeapType::Sampler => 1,
            DescriptorHeapType::Rtv => 2,
            DescriptorHeapType::Dsv => 3,
        }
    }

    /// 是否着色器可见
    pub fn is_shader_visible(self) -> bool {
        matches!(self, DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler)
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorHeapType::CbvSrvUav => "CBV_SRV_UAV",
            DescriptorHeapType::Sampler => "SAMPLER",
            DescriptorHeapType::Rtv => "RTV",
            DescriptorHeapType::Dsv => "DSV",
        }
    }
}

impl fmt::Display for DescriptorHeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 描述符类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    /// 渲染目标视图 (RTV)
    RenderTargetView,
    /// 深度模板视图 (DSV)
    DepthStencilView,
    /// 常量缓冲视图 (CBV)
    ConstantBufferView,
    /// 着色资源视图 (SRV)
    ShaderResourceView,
    /// 无序访问视图 (UAV)
    UnorderedAccessView,
    /// 采样器
    Sampler,
}

impl DescriptorType {
    /// 所属的堆类型
    pub fn heap_type(&self) -> DescriptorHeapType {
        match self {
            DescriptorType::RenderTargetView => DescriptorHeapType::Rtv,
            DescriptorType::DepthStencilView => DescriptorHeapType::Dsv,
            DescriptorType::ConstantBufferView
            | DescriptorType::ShaderResourceView
            | DescriptorType::UnorderedAccessView => DescriptorHeapType::CbvSrvUav,
            DescriptorType::Sampler => DescriptorHeapType::Sampler,
        }
    }

    /// 获取描述符类型名称
    pub fn name(&self) -> &'static str {
        match self {
            DescriptorType::RenderTargetView => "RTV",
            DescriptorType::DepthStencilView => "DSV",
            DescriptorType::ConstantBufferView => "CBV",
            DescriptorType::ShaderResourceView => "SRV",
            DescriptorType::UnorderedAccessView => "UAV",
            DescriptorType::Sampler => "Sampler",
        }
    }
}

/// 描述符所在区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorRegion {
    Persistent,
    Temporary,
}

impl DescriptorRegion {
    fn name(self) -> &'static str {
        match self {
            DescriptorRegion::Persistent => "persistent",
            DescriptorRegion::Temporary => "temporary",
        }
    }
}

/// 描述符句柄（CPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDescriptorHandle {
    /// 句柄指针值
    pub ptr: usize,
    /// 描述符索引
    pub index: u32,
}

impl CpuDescriptorHandle {
    /// 创建新的 CPU 描述符句柄
    pub fn new(ptr: usize, index: u32) -> Self {
        Self { ptr, index }
    }

    /// 偏移句柄
    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + count as usize * increment_size as usize,
            index: self.index + count,
        }
    }
}

/// 描述符句柄（GPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDescriptorHandle {
    /// 句柄指针值
    pub ptr: u64,
    /// 描述符索引
    pub index: u32,
}

impl GpuDescriptorHandle {
    /// 创建新的 GPU 描述符句柄
    pub fn new(ptr: u64, index: u32) -> Self {
        Self { ptr, index }
    }

    /// 偏移句柄
    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + u64::from(count) * u64::from(increment_size),
            index: self.index + count,
        }
    }
}

/// 描述符堆中的一段槽位
///
/// 持久句柄 `count` 恒为 1；临时句柄是 `count` 个连续槽位的首个。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHandle {
    /// CPU 可见句柄
    pub cpu: CpuDescriptorHandle,
    /// GPU 可见句柄（仅对着色器可见的堆有效）
    pub gpu: Option<GpuDescriptorHandle>,
    pub index: u32,
    pub count: u32,
    pub heap_type: DescriptorHeapType,
    pub region: DescriptorRegion,
}

impl DescriptorHandle {
    /// 表内第 `i` 个槽位（单个槽位的句柄）
    pub fn element(&self, i: u32, increment_size: u32) -> DescriptorHandle {
        debug_assert!(i < self.count);
        DescriptorHandle {
            cpu: self.cpu.offset(i, increment_size),
            gpu: self.gpu.map(|g| g.offset(i, increment_size)),
            index: self.index + i,
            count: 1,
            heap_type: self.heap_type,
            region: self.region,
        }
    }
}

/// 描述符堆描述信息
#[derive(Debug, Clone)]
pub struct DescriptorHeapDescriptor {
    pub heap_type: DescriptorHeapType,
    pub capacity: HeapCapacity,
    /// 是否着色器可见
    pub shader_visible: bool,
    /// 调试名称
    pub name: Option<String>,
}

impl DescriptorHeapDescriptor {
    /// 创建新的描述符堆描述符
    pub fn new(heap_type: DescriptorHeapType, capacity: HeapCapacity) -> Self {
        Self {
            heap_type,
            capacity,
            shader_visible: heap_type.is_shader_visible(),
            name: None,
        }
    }

    /// 设置调试名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 创建 RTV 堆描述符
    pub fn rtv(capacity: HeapCapacity) -> Self {
        Self::new(DescriptorHeapType::Rtv, capacity).with_name("RTV Heap")
    }

    /// 创建 DSV 堆描述符
    pub fn dsv(capacity: HeapCapacity) -> Self {
        Self::new(DescriptorHeapType::Dsv, capacity).with_name("DSV Heap")
    }

    /// 创建 SRV/CBV/UAV 堆描述符
    pub fn cbv_srv_uav(capacity: HeapCapacity) -> Self {
        Self::new(DescriptorHeapType::CbvSrvUav, capacity).with_name("SRV/CBV/UAV Heap")
    }

    /// 创建采样器堆描述符
    pub fn sampler(capacity: HeapCapacity) -> Self {
        Self::new(DescriptorHeapType::Sampler, capacity).with_name("Sampler Heap")
    }

    /// 按配置生成四个堆的描述
    pub fn from_config(config: &DescriptorConfig) -> [DescriptorHeapDescriptor; 4] {
        [
            Self::cbv_srv_uav(config.cbv_srv_uav),
            Self::sampler(config.sampler),
            Self::rtv(config.rtv),
            Self::dsv(config.dsv),
        ]
    }
}

/// 描述符堆统计信息
#[derive(Debug, Clone)]
pub struct DescriptorHeapStats {
    pub heap_type: DescriptorHeapType,
    /// 总容量
    pub capacity: u32,
    /// 已使用数量
    pub used: u32,
    pub persistent_used: u32,
    pub temporary_used: u32,
    /// 可用数量
    pub available: u32,
    /// 使用率 (0.0 - 1.0)
    pub usage_ratio: f32,
}

impl DescriptorHeapStats {
    /// 创建新的统计信息
    pub fn new(heap_type: DescriptorHeapType, capacity: u32, persistent_used: u32, temporary_used: u32) -> Self {
        let used = persistent_used + temporary_used;
        let available = capacity.saturating_sub(used);
        let usage_ratio = if capacity > 0 {
            used as f32 / capacity as f32
        } else {
            0.0
        };

        Self {
            heap_type,
            capacity,
            used,
            persistent_used,
            temporary_used,
            available,
            usage_ratio,
        }
    }
}

/// 描述符堆分配器
///
/// 只管理索引与地址，后端堆对象由设备持有。
pub struct DescriptorHeap {
    desc: DescriptorHeapDescriptor,
    increment_size: u32,
    cpu_base: usize,
    gpu_base: Option<u64>,
    next_persistent: u32,
    free_persistent: VecDeque<u32>,
    live_persistent: Vec<bool>,
    persistent_used: u32,
    temporary: RingCursor,
}

impl DescriptorHeap {
    /// 创建描述符堆分配器
    ///
    /// `gpu_base` 只对着色器可见的堆有意义，其余堆忽略。
    pub fn new(desc: DescriptorHeapDescriptor, increment_size: u32, cpu_base: usize, gpu_base: Option<u64>) -> Self {
        let gpu_base = if desc.shader_visible { gpu_base } else { None };
        let persistent = desc.capacity.persistent;
        let temporary = desc.capacity.temporary;
        Self {
            increment_size,
            cpu_base,
            gpu_base,
            next_persistent: 0,
            free_persistent: VecDeque::new(),
            live_persistent: vec![false; persistent as usize],
            persistent_used: 0,
            temporary: RingCursor::new(u64::from(temporary)),
            desc,
        }
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.desc.heap_type
    }

    pub fn descriptor(&self) -> &DescriptorHeapDescriptor {
        &self.desc
    }

    pub fn increment_size(&self) -> u32 {
        self.increment_size
    }

    pub fn capacity(&self) -> HeapCapacity {
        self.desc.capacity
    }

    /// 第 `index` 个槽位的地址
    fn handle_at(&self, index: u32, count: u32, region: DescriptorRegion) -> DescriptorHandle {
        let cpu = CpuDescriptorHandle::new(self.cpu_base, 0).offset(index, self.increment_size);
        let gpu = self
            .gpu_base
            .map(|base| GpuDescriptorHandle::new(base, 0).offset(index, self.increment_size));
        DescriptorHandle {
            cpu,
            gpu,
            index,
            count,
            heap_type: self.desc.heap_type,
            region,
        }
    }

    fn exhausted(&self, region: DescriptorRegion, capacity: u32, requested: u32) -> RhiError {
        error!(
            heap = %self.desc.heap_type,
            region = region.name(),
            capacity,
            requested,
            "Descriptor heap exhausted, increase its configured capacity"
        );
        RhiError::DescriptorHeapExhausted {
            heap: self.desc.heap_type.name(),
            region: region.name(),
            capacity,
            requested,
        }
    }

    /// 分配一个持久描述符
    pub fn allocate_persistent(&mut self) -> Result<DescriptorHandle> {
        let capacity = self.desc.capacity.persistent;
        let index = match self.free_persistent.pop_front() {
            Some(index) => index,
            None if self.next_persistent < capacity => {
                let index = self.next_persistent;
                self.next_persistent += 1;
                index
            }
            None => return Err(self.exhausted(DescriptorRegion::Persistent, capacity, 1)),
        };

        self.live_persistent[index as usize] = true;
        self.persistent_used += 1;
        Ok(self.handle_at(index, 1, DescriptorRegion::Persistent))
    }

    /// 立即释放持久描述符
    ///
    /// 调用方保证 GPU 不再引用它（资源自身走延迟删除）。
    pub fn free_persistent(&mut self, handle: &DescriptorHandle) {
        let heap = self.desc.heap_type;
        if !rhi_ensure!(
            handle.heap_type == heap && handle.region == DescriptorRegion::Persistent,
            "free_persistent on {} heap with {:?} handle from {} heap",
            heap,
            handle.region,
            handle.heap_type
        ) {
            return;
        }
        let live = self
            .live_persistent
            .get(handle.index as usize)
            .copied()
            .unwrap_or(false);
        if !rhi_ensure!(live, "{} descriptor {} freed twice or never allocated", heap, handle.index) {
            return;
        }

        self.live_persistent[handle.index as usize] = false;
        self.persistent_used -= 1;
        self.free_persistent.push_back(handle.index);
    }

    /// 分配 `count` 个连续的临时描述符
    pub fn allocate_temporary(&mut self, count: u32) -> Result<DescriptorHandle> {
        if count == 0 {
            return Err(RhiError::ContractViolation(format!(
                "zero-sized temporary descriptor table on {} heap",
                self.desc.heap_type
            )));
        }
        self.temporary.reclaim();
        match self.temporary.try_allocate(u64::from(count), 1) {
            Some(offset) => {
                let index = self.desc.capacity.persistent + offset as u32;
                Ok(self.handle_at(index, count, DescriptorRegion::Temporary))
            }
            None => Err(self.exhausted(DescriptorRegion::Temporary, self.desc.capacity.temporary, count)),
        }
    }

    /// 释放临时描述符表，`sync` 完成后才会复用
    pub fn free_temporary(&mut self, handle: &DescriptorHandle, sync: SyncPoint) {
        let heap = self.desc.heap_type;
        if !rhi_ensure!(
            handle.heap_type == heap && handle.region == DescriptorRegion::Temporary,
            "free_temporary on {} heap with {:?} handle from {} heap",
            heap,
            handle.region,
            handle.heap_type
        ) {
            return;
        }
        let offset = u64::from(handle.index - self.desc.capacity.persistent);
        match self.temporary.retire(offset, sync) {
            Ok(()) => {}
            Err(RetireError::AlreadyRetired) => {
                rhi_ensure!(false, "{} temporary descriptors at {} freed twice", heap, handle.index);
            }
            Err(RetireError::UnknownBlock) => {
                rhi_ensure!(false, "{} temporary descriptors at {} are not live", heap, handle.index);
            }
        }
    }

    /// 回收已完成的临时区块
    pub fn reclaim_temporary(&mut self) -> usize {
        self.temporary.reclaim()
    }

    pub fn stats(&self) -> DescriptorHeapStats {
        DescriptorHeapStats::new(
            self.desc.heap_type,
            self.desc.capacity.total(),
            self.persistent_used,
            self.temporary.used() as u32,
        )
    }
}

/// 描述符管理器
///
/// 每种堆类型一个 [`DescriptorHeap`]。
pub struct DescriptorManager {
    heaps: Vec<DescriptorHeap>,
}

impl DescriptorManager {
    /// 由四个堆构造，顺序不限
    pub fn new(heaps: impl IntoIterator<Item = DescriptorHeap>) -> Result<Self> {
        let mut slots: Vec<Option<DescriptorHeap>> = (0..DescriptorHeapType::ALL.len()).map(|_| None).collect();
        for heap in heaps {
            let index = heap.heap_type().index();
            if slots[index].is_some() {
                return Err(RhiError::ContractViolation(format!(
                    "duplicate {} descriptor heap",
                    heap.heap_type()
                )));
            }
            slots[index] = Some(heap);
        }

        let mut heaps = Vec::with_capacity(slots.len());
        for (slot, ty) in slots.into_iter().zip(DescriptorHeapType::ALL) {
            match slot {
                Some(heap) => heaps.push(heap),
                None => {
                    return Err(RhiError::ContractViolation(format!(
                        "missing {} descriptor heap",
                        ty
                    )))
                }
            }
        }
        Ok(Self { heaps })
    }

    pub fn heap(&self, heap_type: DescriptorHeapType) -> &DescriptorHeap {
        &self.heaps[heap_type.index()]
    }

    pub fn heap_mut(&mut self, heap_type: DescriptorHeapType) -> &mut DescriptorHeap {
        &mut self.heaps[heap_type.index()]
    }

    /// 分配描述符
    pub fn allocate_persistent(&mut self, heap_type: DescriptorHeapType) -> Result<DescriptorHandle> {
        self.heap_mut(heap_type).allocate_persistent()
    }

    /// 释放描述符
    pub fn free_persistent(&mut self, handle: &DescriptorHandle) {
        self.heap_mut(handle.heap_type).free_persistent(handle)
    }

    pub fn allocate_temporary(&mut self, heap_type: DescriptorHeapType, count: u32) -> Result<DescriptorHandle> {
        self.heap_mut(heap_type).allocate_temporary(count)
    }

    pub fn free_temporary(&mut self, handle: &DescriptorHandle, sync: SyncPoint) {
        self.heap_mut(handle.heap_type).free_temporary(handle, sync)
    }

    /// 获取统计信息
    pub fn stats(&self) -> Vec<DescriptorHeapStats> {
        self.heaps.iter().map(DescriptorHeap::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::sync::{FenceValue, SoftwareFence};
    use std::sync::Arc;

    fn heap(persistent: u32, temporary: u32) -> DescriptorHeap {
        let desc = DescriptorHeapDescriptor::cbv_srv_uav(HeapCapacity::new(persistent, temporary));
        DescriptorHeap::new(desc, 32, 0x1000, Some(0x8000_0000))
    }

    fn point(fence: &Arc<SoftwareFence>, value: u64) -> SyncPoint {
        SyncPoint::new(fence.clone(), FenceValue::new(value))
    }

    #[test]
    fn test_descriptor_type_heap_mapping() {
        assert_eq!(DescriptorType::ConstantBufferView.heap_type(), DescriptorHeapType::CbvSrvUav);
        assert_eq!(DescriptorType::UnorderedAccessView.heap_type(), DescriptorHeapType::CbvSrvUav);
        assert_eq!(DescriptorType::RenderTargetView.heap_type(), DescriptorHeapType::Rtv);
        assert!(DescriptorHeapType::Sampler.is_shader_visible());
        assert!(!DescriptorHeapType::Dsv.is_shader_visible());
    }

    #[test]
    fn test_address_formula() {
        let mut heap = heap(4, 4);
        let a = heap.allocate_persistent().unwrap();
        let b = heap.allocate_persistent().unwrap();
        assert_eq!(a.cpu.ptr, 0x1000);
        assert_eq!(b.cpu.ptr, 0x1000 + 32);
        assert_eq!(b.gpu.unwrap().ptr, 0x8000_0000 + 32);
        heap.free_persistent(&a);
        heap.free_persistent(&b);
    }

    #[test]
    fn test_non_shader_visible_has_no_gpu_handle() {
        let desc = DescriptorHeapDescriptor::rtv(HeapCapacity::new(2, 0));
        let mut heap = DescriptorHeap::new(desc, 8, 0, Some(0x1000));
        let rtv = heap.allocate_persistent().unwrap();
        assert!(rtv.gpu.is_none());
    }

    #[test]
    fn test_persistent_reuse_and_exhaustion() {
        let mut heap = heap(2, 0);
        let a = heap.allocate_persistent().unwrap();
        let b = heap.allocate_persistent().unwrap();
        assert!(matches!(
            heap.allocate_persistent(),
            Err(RhiError::DescriptorHeapExhausted { region: "persistent", .. })
        ));

        heap.free_persistent(&a);
        let c = heap.allocate_persistent().unwrap();
        assert_eq!(c.index, a.index);
        assert_eq!(heap.stats().persistent_used, 2);
        let _ = b;
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "contract violation")]
    fn test_persistent_double_free_asserts() {
        let mut heap = heap(2, 0);
        let a = heap.allocate_persistent().unwrap();
        heap.free_persistent(&a);
        heap.free_persistent(&a);
    }

    #[test]
    fn test_temporary_region_is_contiguous_and_separate() {
        let mut heap = heap(8, 16);
        let table = heap.allocate_temporary(4).unwrap();
        assert_eq!(table.index, 8);
        assert_eq!(table.count, 4);
        assert_eq!(table.region, DescriptorRegion::Temporary);

        let third = table.element(2, heap.increment_size());
        assert_eq!(third.index, 10);
        assert_eq!(third.cpu.ptr, 0x1000 + 10 * 32);
    }

    #[test]
    fn test_temporary_not_reused_before_fence() {
        let fence = Arc::new(SoftwareFence::new(0));
        let mut heap = heap(0, 8);

        let a = heap.allocate_temporary(8).unwrap();
        heap.free_temporary(&a, point(&fence, 1));
        assert!(matches!(
            heap.allocate_temporary(1),
            Err(RhiError::DescriptorHeapExhausted { region: "temporary", .. })
        ));

        fence.signal(1);
        let b = heap.allocate_temporary(8).unwrap();
        assert_eq!(b.index, a.index);
    }

    #[test]
    fn test_stats() {
        let mut heap = heap(4, 4);
        let _a = heap.allocate_persistent().unwrap();
        let _t = heap.allocate_temporary(2).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.capacity, 8);
        assert_eq!(stats.used, 3);
        assert_eq!(stats.available, 5);
        assert!((stats.usage_ratio - 0.375).abs() < f32::EPSILON);
    }

    #[test]
    fn test_manager_requires_every_heap() {
        let config = DescriptorConfig::default();
        let heaps: Vec<_> = DescriptorHeapDescriptor::from_config(&config)
            .into_iter()
            .map(|desc| DescriptorHeap::new(desc, 1, 0, Some(0)))
            .collect();
        let mut manager = DescriptorManager::new(heaps).unwrap();

        let srv = manager.allocate_persistent(DescriptorHeapType::CbvSrvUav).unwrap();
        assert_eq!(srv.heap_type, DescriptorHeapType::CbvSrvUav);
        manager.free_persistent(&srv);
        assert_eq!(manager.stats().len(), 4);

        let partial = vec![DescriptorHeap::new(DescriptorHeapDescriptor::rtv(HeapCapacity::new(1, 0)), 1, 0, None)];
        assert!(DescriptorManager::new(partial).is_err());
    }
}
