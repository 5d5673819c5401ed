//! 设备
//!
//! [`Device`] 把后端对象、资源池、描述符堆、上传环形缓冲区、命令队列和延迟删除队列
//! 组合在一起，是上层渲染代码唯一直接持有的对象。
//!
//! # 帧循环
//!
//! ```ignore
//! loop {
//!     device.begin_frame()?;      // 等待 N 帧之前的栅栏，推进延迟删除
//!     let mut ctx = device.context(QueueType::Direct)?;
//!     // ... 录制 ...
//!     device.execute(ctx)?;
//!     device.end_frame()?;        // 在每个队列上追加信号
//! }
//! device.shutdown()?;
//! ```

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use crate::core::config::Config;
use crate::core::error::{Result, RhiError};
use crate::rhi_ensure;

use super::backend_trait::{DescriptorView, RenderBackend};
use super::command::{resolve_barrier, CommandContext, CommandQueue, ContextId, ContextParts, QueueType};
use super::deletion::DeferredDeletionQueue;
use super::descriptor::{
    DescriptorHandle, DescriptorHeap, DescriptorHeapDescriptor, DescriptorHeapStats, DescriptorHeapType,
    DescriptorManager,
};
use super::resource::{
    BindGroupEntry, BindingLayout, Buffer, BufferDescriptor, BufferHandle, BufferUsage, BufferViews, LiveCounts,
    MemoryType, Pipeline, PipelineHandle, ResourcePools, SamplerDescriptor, Shader, ShaderDescriptor, ShaderHandle,
    ShaderStage, Texture, TextureDescriptor, TextureHandle, TextureUsage, TextureViews,
};
use super::ring_buffer::{MappedMemory, RingBufferAllocator, RingBufferStats};
use super::state::{Barrier, GlobalResourceStates, ResourceKey};
use super::sync::{FenceValue, SyncPoint};

/// 等待延迟销毁的对象
pub enum PendingRelease<B: RenderBackend> {
    Buffer(BufferHandle<B>),
    Texture(TextureHandle<B>),
    Shader(ShaderHandle<B>),
    Pipeline(PipelineHandle<B>),
    Sampler(DescriptorHandle),
}

/// 已经排队销毁的对象，用于拒绝重复销毁
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PendingKey {
    Resource(ResourceKey),
    Shader(u32),
    Pipeline(u32),
    Sampler(u32),
}

impl<B: RenderBackend> PendingRelease<B> {
    fn key(&self) -> PendingKey {
        match self {
            PendingRelease::Buffer(h) => PendingKey::Resource(ResourceKey::Buffer(h.to_bits())),
            PendingRelease::Texture(h) => PendingKey::Resource(ResourceKey::Texture(h.to_bits())),
            PendingRelease::Shader(h) => PendingKey::Shader(h.to_bits()),
            PendingRelease::Pipeline(h) => PendingKey::Pipeline(h.to_bits()),
            PendingRelease::Sampler(d) => PendingKey::Sampler(d.index),
        }
    }
}

/// 设备统计
#[derive(Debug, Clone)]
pub struct DeviceStats {
    pub frame_index: u64,
    pub submissions: u64,
    /// 提交前为对齐跨上下文状态而插入的修正屏障数
    pub state_fixups: u64,
    pub pending_deletions: usize,
    pub live: LiveCounts,
    pub upload_ring: RingBufferStats,
    pub descriptor_heaps: Vec<DescriptorHeapStats>,
}

/// 设备
pub struct Device<B: RenderBackend> {
    resources: ResourcePools<B>,
    descriptors: DescriptorManager,
    raw_heaps: Vec<B::DescriptorHeap>,
    upload_ring: RingBufferAllocator,
    upload_buffer: Option<B::Buffer>,
    queues: Vec<CommandQueue<B>>,
    deletion: DeferredDeletionQueue<PendingRelease<B>>,
    pending_destroy: HashSet<PendingKey>,
    frame_syncs: Vec<Vec<SyncPoint>>,
    resource_states: GlobalResourceStates,
    frame_index: u64,
    next_context: u32,
    submissions: u64,
    state_fixups: u64,
    fence_timeout: Option<Duration>,
    shut_down: bool,
    // 最后析构
    backend: B,
}

impl<B: RenderBackend> Device<B> {
    /// 创建设备
    pub fn new(backend: B, config: &Config) -> Result<Self> {
        config.validate()?;
        let fence_timeout = config.device.fence_timeout_ms.map(Duration::from_millis);
        let buffered_frames = config.device.buffered_frames as u8;

        // 原生堆按堆类型下标排列
        let mut raw_slots: Vec<Option<B::DescriptorHeap>> = DescriptorHeapType::ALL.iter().map(|_| None).collect();
        let mut heaps = Vec::with_capacity(raw_slots.len());
        for desc in DescriptorHeapDescriptor::from_config(&config.descriptors) {
            let raw = backend.create_descriptor_heap(&desc)?;
            let (cpu_base, gpu_base) = backend.descriptor_heap_base(&raw);
            let increment = backend.descriptor_increment_size(desc.heap_type);
            debug!(
                heap = %desc.heap_type,
                persistent = desc.capacity.persistent,
                temporary = desc.capacity.temporary,
                increment,
                "Descriptor heap created"
            );
            raw_slots[desc.heap_type.index()] = Some(raw);
            heaps.push(DescriptorHeap::new(desc, increment, cpu_base, gpu_base));
        }
        let descriptors = DescriptorManager::new(heaps)?;
        let raw_heaps: Vec<B::DescriptorHeap> = raw_slots.into_iter().flatten().collect();

        let mut queues = Vec::with_capacity(QueueType::ALL.len());
        for queue_type in QueueType::ALL {
            queues.push(CommandQueue::new(
                &backend,
                queue_type,
                config.device.command_lists_per_queue,
                fence_timeout,
            )?);
        }

        let ring_size = config.upload.ring_buffer_size;
        let upload_desc = BufferDescriptor::new(ring_size, BufferUsage::COPY_SRC, MemoryType::Upload)
            .with_name("upload ring buffer");
        let upload_buffer = backend.create_buffer(&upload_desc)?;
        let mapped = backend
            .map_buffer(&upload_buffer)?
            // SAFETY: 上传缓冲区持久映射 `ring_size` 字节，直到设备关闭才销毁
            .map(|ptr| unsafe { MappedMemory::new(ptr, ring_size) });
        let upload_ring = RingBufferAllocator::new(ring_size, config.upload.alignment)?
            .with_memory(mapped, backend.buffer_gpu_address(&upload_buffer))
            .with_wait_timeout(fence_timeout);

        info!(
            backend = %backend.api(),
            adapter = backend.adapter_name(),
            buffered_frames,
            upload_ring = ring_size,
            "Device created"
        );

        Ok(Self {
            resources: ResourcePools::new(&config.pools),
            descriptors,
            raw_heaps,
            upload_ring,
            upload_buffer: Some(upload_buffer),
            queues,
            deletion: DeferredDeletionQueue::new(buffered_frames),
            pending_destroy: HashSet::new(),
            frame_syncs: vec![Vec::new(); usize::from(buffered_frames.max(1))],
            resource_states: GlobalResourceStates::new(),
            frame_index: 0,
            next_context: 0,
            submissions: 0,
            state_fixups: 0,
            fence_timeout,
            shut_down: false,
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn resources(&self) -> &ResourcePools<B> {
        &self.resources
    }

    pub fn descriptors(&self) -> &DescriptorManager {
        &self.descriptors
    }

    /// 已提交工作结束时各资源的状态
    pub fn resource_states(&self) -> &GlobalResourceStates {
        &self.resource_states
    }

    pub(crate) fn descriptors_mut(&mut self) -> &mut DescriptorManager {
        &mut self.descriptors
    }

    pub(crate) fn upload_ring_mut(&mut self) -> &mut RingBufferAllocator {
        &mut self.upload_ring
    }

    pub(crate) fn upload_buffer_raw(&self) -> Result<&B::Buffer> {
        self.upload_buffer
            .as_ref()
            .ok_or_else(|| RhiError::CommandRecording("device is shut down".to_string()))
    }

    pub(crate) fn raw_heap(&self, heap_type: DescriptorHeapType) -> &B::DescriptorHeap {
        &self.raw_heaps[heap_type.index()]
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn buffered_frames(&self) -> u8 {
        self.deletion.buffered_frames()
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletion.len()
    }

    pub fn descriptor_stats(&self) -> Vec<DescriptorHeapStats> {
        self.descriptors.stats()
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            frame_index: self.frame_index,
            submissions: self.submissions,
            state_fixups: self.state_fixups,
            pending_deletions: self.deletion.len(),
            live: self.resources.live_counts(),
            upload_ring: self.upload_ring.stats(),
            descriptor_heaps: self.descriptors.stats(),
        }
    }

    // ---- 缓冲区 ----

    /// 创建缓冲区，并为用途对应的默认视图写入持久描述符
    pub fn create_buffer(&mut self, desc: &BufferDescriptor) -> Result<BufferHandle<B>> {
        desc.validate()?;
        let mut desc = desc.clone();
        desc.size = desc.aligned_size();

        let raw = self.backend.create_buffer(&desc)?;
        let mapped = if desc.memory_type.is_host_visible() {
            match self.backend.map_buffer(&raw) {
                // SAFETY: 映射在缓冲区销毁前一直有效
                Ok(ptr) => ptr.map(|p| unsafe { MappedMemory::new(p, desc.size) }),
                Err(err) => {
                    self.backend.destroy_buffer(raw);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let views = match self.create_buffer_views(&raw, &desc) {
            Ok(views) => views,
            Err(err) => {
                self.backend.destroy_buffer(raw);
                return Err(err);
            }
        };

        let gpu_address = self.backend.buffer_gpu_address(&raw);
        let mut buffer = Buffer::new(desc, raw, mapped, gpu_address);
        buffer.views = views;
        let handle = self.resources.buffers.allocate(buffer)?;
        if let Some(buffer) = self.resources.buffers.get_mut(handle) {
            buffer.key = ResourceKey::Buffer(handle.to_bits());
            debug!(
                handle = %handle,
                size = buffer.desc.size,
                name = buffer.desc.name.as_deref().unwrap_or(""),
                "Buffer created"
            );
        }
        Ok(handle)
    }

    fn create_buffer_views(&mut self, raw: &B::Buffer, desc: &BufferDescriptor) -> Result<BufferViews> {
        let mut views = BufferViews::default();
        let result = (|| -> Result<()> {
            if desc.usage.contains(BufferUsage::UNIFORM) {
                let slot = self.descriptors.allocate_persistent(DescriptorHeapType::CbvSrvUav)?;
                views.cbv = Some(slot);
                let view = DescriptorView::ConstantBuffer {
                    buffer: raw,
                    offset: 0,
                    size: desc.size,
                };
                self.backend
                    .write_descriptor(&mut self.raw_heaps[DescriptorHeapType::CbvSrvUav.index()], &slot, view)?;
            }
            if desc.usage.contains(BufferUsage::STORAGE) {
                let slot = self.descriptors.allocate_persistent(DescriptorHeapType::CbvSrvUav)?;
                views.srv = Some(slot);
                let view = DescriptorView::BufferSrv {
                    buffer: raw,
                    offset: 0,
                    size: desc.size,
                    stride: desc.stride,
                };
                self.backend
                    .write_descriptor(&mut self.raw_heaps[DescriptorHeapType::CbvSrvUav.index()], &slot, view)?;

                let slot = self.descriptors.allocate_persistent(DescriptorHeapType::CbvSrvUav)?;
                views.uav = Some(slot);
                let view = DescriptorView::BufferUav {
                    buffer: raw,
                    offset: 0,
                    size: desc.size,
                    stride: desc.stride,
                };
                self.backend
                    .write_descriptor(&mut self.raw_heaps[DescriptorHeapType::CbvSrvUav.index()], &slot, view)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(views),
            Err(err) => {
                for slot in views.iter() {
                    self.descriptors.free_persistent(slot);
                }
                Err(err)
            }
        }
    }

    pub fn buffer(&self, handle: BufferHandle<B>) -> Result<&Buffer<B>> {
        self.resources.buffer(handle)
    }

    /// 延迟销毁缓冲区
    pub fn destroy_buffer(&mut self, handle: BufferHandle<B>) {
        if !rhi_ensure!(
            self.resources.buffers.contains(handle),
            "destroy_buffer: stale handle {}",
            handle
        ) {
            return;
        }
        self.defer_release(PendingRelease::Buffer(handle));
    }

    /// 写入上传堆缓冲区的映射内存
    pub fn write_buffer(&mut self, handle: BufferHandle<B>, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.resources.buffer(handle)?;
        if buffer.desc.memory_type != MemoryType::Upload {
            return Err(RhiError::ContractViolation(format!(
                "write_buffer needs an upload buffer, {} is {:?}",
                handle, buffer.desc.memory_type
            )));
        }
        let ptr = mapped_range(buffer, offset, data.len() as u64)?;
        // SAFETY: 范围已检查在映射内存之内
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Ok(())
    }

    /// 读取读回堆（或上传堆）缓冲区的内容，调用方保证 GPU 写入已完成
    pub fn read_buffer(&self, handle: BufferHandle<B>, offset: u64, len: u64) -> Result<Vec<u8>> {
        let buffer = self.resources.buffer(handle)?;
        let ptr = mapped_range(buffer, offset, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: 范围已检查在映射内存之内
        unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(out)
    }

    // ---- 纹理 ----

    pub fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureHandle<B>> {
        desc.validate()?;
        let raw = self.backend.create_texture(desc)?;
        let views = match self.create_texture_views(&raw, desc) {
            Ok(views) => views,
            Err(err) => {
                self.backend.destroy_texture(raw);
                return Err(err);
            }
        };

        let mut texture = Texture::new(desc.clone(), raw);
        texture.views = views;
        let handle = self.resources.textures.allocate(texture)?;
        if let Some(texture) = self.resources.textures.get_mut(handle) {
            texture.key = ResourceKey::Texture(handle.to_bits());
            debug!(
                handle = %handle,
                width = desc.width,
                height = desc.height,
                format = ?desc.format,
                name = desc.name.as_deref().unwrap_or(""),
                "Texture created"
            );
        }
        Ok(handle)
    }

    fn create_texture_views(&mut self, raw: &B::Texture, desc: &TextureDescriptor) -> Result<TextureViews> {
        let mut views = TextureViews::default();
        let result = (|| -> Result<()> {
            let wanted = [
                (TextureUsage::SAMPLED, DescriptorHeapType::CbvSrvUav),
                (TextureUsage::STORAGE, DescriptorHeapType::CbvSrvUav),
                (TextureUsage::RENDER_TARGET, DescriptorHeapType::Rtv),
                (TextureUsage::DEPTH_STENCIL, DescriptorHeapType::Dsv),
            ];
            for (usage, heap_type) in wanted {
                if !desc.usage.contains(usage) {
                    continue;
                }
                let slot = self.descriptors.allocate_persistent(heap_type)?;
                let view = if usage == TextureUsage::SAMPLED {
                    views.srv = Some(slot);
                    DescriptorView::TextureSrv { texture: raw, desc }
                } else if usage == TextureUsage::STORAGE {
                    views.uav = Some(slot);
                    DescriptorView::TextureUav { texture: raw, desc, mip: 0 }
                } else if usage == TextureUsage::RENDER_TARGET {
                    views.rtv = Some(slot);
                    DescriptorView::RenderTarget { texture: raw, desc, mip: 0 }
                } else {
                    views.dsv = Some(slot);
                    DescriptorView::DepthStencil { texture: raw, desc, mip: 0 }
                };
                self.backend
                    .write_descriptor(&mut self.raw_heaps[heap_type.index()], &slot, view)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(views),
            Err(err) => {
                for slot in views.iter() {
                    self.descriptors.free_persistent(slot);
                }
                Err(err)
            }
        }
    }

    pub fn texture(&self, handle: TextureHandle<B>) -> Result<&Texture<B>> {
        self.resources.texture(handle)
    }

    /// 延迟销毁纹理
    pub fn destroy_texture(&mut self, handle: TextureHandle<B>) {
        if !rhi_ensure!(
            self.resources.textures.contains(handle),
            "destroy_texture: stale handle {}",
            handle
        ) {
            return;
        }
        self.defer_release(PendingRelease::Texture(handle));
    }

    // ---- 采样器 ----

    /// 在采样器堆中创建一个持久采样器
    pub fn create_sampler(&mut self, desc: &SamplerDescriptor) -> Result<DescriptorHandle> {
        let slot = self.descriptors.allocate_persistent(DescriptorHeapType::Sampler)?;
        let heap = &mut self.raw_heaps[DescriptorHeapType::Sampler.index()];
        if let Err(err) = self.backend.write_descriptor(heap, &slot, DescriptorView::Sampler(desc)) {
            self.descriptors.free_persistent(&slot);
            return Err(err);
        }
        Ok(slot)
    }

    pub fn destroy_sampler(&mut self, sampler: DescriptorHandle) {
        if !rhi_ensure!(
            sampler.heap_type == DescriptorHeapType::Sampler,
            "destroy_sampler: descriptor {} belongs to the {} heap",
            sampler.index,
            sampler.heap_type
        ) {
            return;
        }
        self.defer_release(PendingRelease::Sampler(sampler));
    }

    // ---- 着色器与管线 ----

    pub fn create_shader(&mut self, desc: &ShaderDescriptor) -> Result<ShaderHandle<B>> {
        if desc.bytecode.is_empty() {
            return Err(RhiError::ContractViolation("shader bytecode is empty".to_string()));
        }
        let raw = self.backend.create_shader(desc)?;
        let shader = Shader {
            stage: desc.stage,
            entry_point: desc.entry_point.clone(),
            raw,
        };
        let handle = self.resources.shaders.allocate(shader)?;
        debug!(handle = %handle, stage = ?desc.stage, "Shader created");
        Ok(handle)
    }

    pub fn destroy_shader(&mut self, handle: ShaderHandle<B>) {
        if !rhi_ensure!(
            self.resources.shaders.contains(handle),
            "destroy_shader: stale handle {}",
            handle
        ) {
            return;
        }
        self.defer_release(PendingRelease::Shader(handle));
    }

    /// 由计算着色器和显式布局创建计算管线
    pub fn create_compute_pipeline(
        &mut self,
        shader: ShaderHandle<B>,
        layout: BindingLayout,
    ) -> Result<PipelineHandle<B>> {
        let shader_obj = self.resources.shader(shader)?;
        if shader_obj.stage != ShaderStage::Compute {
            return Err(RhiError::ContractViolation(format!(
                "compute pipeline needs a compute shader, {} is {:?}",
                shader, shader_obj.stage
            )));
        }
        let raw = self.backend.create_compute_pipeline(
            &shader_obj.raw,
            &shader_obj.entry_point,
            &layout,
            &self.raw_heaps[DescriptorHeapType::CbvSrvUav.index()],
            &self.raw_heaps[DescriptorHeapType::Sampler.index()],
        )?;
        let slots = layout.descriptor_count();
        let handle = self.resources.pipelines.allocate(Pipeline { layout, shader, raw })?;
        debug!(handle = %handle, slots, "Compute pipeline created");
        Ok(handle)
    }

    pub fn destroy_pipeline(&mut self, handle: PipelineHandle<B>) {
        if !rhi_ensure!(
            self.resources.pipelines.contains(handle),
            "destroy_pipeline: stale handle {}",
            handle
        ) {
            return;
        }
        self.defer_release(PendingRelease::Pipeline(handle));
    }

    fn defer_release(&mut self, item: PendingRelease<B>) {
        let key = item.key();
        if !rhi_ensure!(self.pending_destroy.insert(key), "{:?} destroyed twice", key) {
            return;
        }
        self.deletion.enqueue(item);
    }

    /// 把绑定组条目写入临时描述符表的一个槽位
    pub(crate) fn write_bind_entry(&mut self, slot: &DescriptorHandle, entry: &BindGroupEntry<B>) -> Result<()> {
        let view = match entry {
            BindGroupEntry::ConstantBuffer(h) => {
                let buffer = self.resources.buffer(*h)?;
                require_usage(buffer.desc.usage.contains(BufferUsage::UNIFORM), "constant buffer", *h)?;
                DescriptorView::ConstantBuffer {
                    buffer: &buffer.raw,
                    offset: 0,
                    size: buffer.desc.size,
                }
            }
            BindGroupEntry::BufferRead(h) => {
                let buffer = self.resources.buffer(*h)?;
                require_usage(buffer.desc.usage.contains(BufferUsage::STORAGE), "storage buffer", *h)?;
                DescriptorView::BufferSrv {
                    buffer: &buffer.raw,
                    offset: 0,
                    size: buffer.desc.size,
                    stride: buffer.desc.stride,
                }
            }
            BindGroupEntry::BufferReadWrite(h) => {
                let buffer = self.resources.buffer(*h)?;
                require_usage(buffer.desc.usage.contains(BufferUsage::STORAGE), "storage buffer", *h)?;
                DescriptorView::BufferUav {
                    buffer: &buffer.raw,
                    offset: 0,
                    size: buffer.desc.size,
                    stride: buffer.desc.stride,
                }
            }
            BindGroupEntry::TextureRead(h) => {
                let texture = self.resources.texture(*h)?;
                require_usage(texture.desc.usage.contains(TextureUsage::SAMPLED), "sampled texture", *h)?;
                DescriptorView::TextureSrv {
                    texture: &texture.raw,
                    desc: &texture.desc,
                }
            }
            BindGroupEntry::TextureReadWrite(h, mip) => {
                let texture = self.resources.texture(*h)?;
                require_usage(texture.desc.usage.contains(TextureUsage::STORAGE), "storage texture", *h)?;
                if *mip >= texture.desc.mip_levels {
                    return Err(RhiError::CommandRecording(format!(
                        "mip {} out of range for {} ({} mips)",
                        mip, h, texture.desc.mip_levels
                    )));
                }
                DescriptorView::TextureUav {
                    texture: &texture.raw,
                    desc: &texture.desc,
                    mip: *mip,
                }
            }
        };
        self.backend
            .write_descriptor(&mut self.raw_heaps[DescriptorHeapType::CbvSrvUav.index()], slot, view)
    }

    // ---- 命令提交 ----

    /// 在指定队列上开始一次录制
    pub fn context(&mut self, queue_type: QueueType) -> Result<CommandContext<B>> {
        let queue = &mut self.queues[queue_type.index()];
        let mut list = queue.request_command_list(&self.backend)?;
        if let Err(err) = self.backend.begin_command_list(&mut list) {
            let sync = queue.sync_point(queue.last_signaled());
            queue.recycle(list, sync);
            return Err(err);
        }
        let id = ContextId(self.next_context);
        self.next_context = self.next_context.wrapping_add(1);
        trace!(ctx = %id, queue = %queue_type, "Command context opened");
        Ok(CommandContext::new(id, queue_type, list))
    }

    /// 提交上下文，返回它的完成同步点
    ///
    /// 临时描述符和上传内存随该同步点释放，命令列表回到队列的复用池。
    pub fn execute(&mut self, mut ctx: CommandContext<B>) -> Result<SyncPoint> {
        let parts = match ctx.finish(self) {
            Ok(parts) => parts,
            Err(err) => {
                error!(ctx = %ctx.id(), error = %err, "Failed to finish command context");
                self.discard(ctx)?;
                return Err(err);
            }
        };
        debug_assert!(ctx.is_executable());

        let queue_type = ctx.queue_type();
        let fixups = self.resource_states.settle(ctx.tracker());
        if !fixups.is_empty() {
            if let Err(err) = self.submit_fixups(queue_type, &fixups) {
                error!(ctx = %ctx.id(), error = %err, "Failed to submit state fix-up barriers");
                let queue = &self.queues[queue_type.index()];
                let sync = queue.sync_point(queue.last_signaled());
                self.release_parts(queue_type, parts, sync);
                return Err(err);
            }
        }

        let queue = &mut self.queues[queue_type.index()];
        match queue.submit(&self.backend, &parts.list) {
            Ok(sync) => {
                ctx.mark_pending();
                self.submissions += 1;
                trace!(ctx = %ctx.id(), queue = %queue_type, fence = %sync.value(), "Command context executed");
                self.release_parts(queue_type, parts, sync.clone());
                Ok(sync)
            }
            Err(err) => {
                let sync = queue.sync_point(queue.last_signaled());
                self.release_parts(queue_type, parts, sync);
                Err(err)
            }
        }
    }

    /// 在上下文之前提交一个只含修正屏障的命令列表
    fn submit_fixups(&mut self, queue_type: QueueType, fixups: &[Barrier]) -> Result<()> {
        let queue = &mut self.queues[queue_type.index()];
        let mut list = queue.request_command_list(&self.backend)?;
        let recorded = self.backend.begin_command_list(&mut list).and_then(|()| {
            let resolved: Vec<_> = fixups.iter().filter_map(|b| resolve_barrier(&self.resources, b)).collect();
            if !resolved.is_empty() {
                self.backend.cmd_resource_barriers(&mut list, &resolved);
            }
            self.backend.end_command_list(&mut list)
        });
        let submitted = recorded.and_then(|()| queue.submit(&self.backend, &list));
        match submitted {
            Ok(sync) => {
                self.state_fixups += fixups.len() as u64;
                trace!(queue = %queue_type, barriers = fixups.len(), fence = %sync.value(), "State fix-up barriers submitted");
                queue.recycle(list, sync);
                Ok(())
            }
            Err(err) => {
                let sync = queue.sync_point(queue.last_signaled());
                queue.recycle(list, sync);
                Err(err)
            }
        }
    }

    /// 丢弃上下文而不提交
    pub fn discard(&mut self, mut ctx: CommandContext<B>) -> Result<()> {
        let Some(mut parts) = ctx.abandon() else {
            return Ok(());
        };
        // 可能已经关闭，失败可以忽略
        let _ = self.backend.end_command_list(&mut parts.list);
        let queue_type = ctx.queue_type();
        let sync = self.queues[queue_type.index()].signal(&self.backend)?;
        debug!(ctx = %ctx.id(), queue = %queue_type, "Command context discarded");
        self.release_parts(queue_type, parts, sync);
        Ok(())
    }

    fn release_parts(&mut self, queue_type: QueueType, parts: ContextParts<B>, sync: SyncPoint) {
        for table in &parts.temp_descriptors {
            self.descriptors.free_temporary(table, sync.clone());
        }
        for allocation in &parts.uploads {
            self.upload_ring.free(allocation, sync.clone());
        }
        self.queues[queue_type.index()].recycle(parts.list, sync);
    }

    /// 在队列上追加一次信号
    pub fn signal(&mut self, queue_type: QueueType) -> Result<SyncPoint> {
        self.queues[queue_type.index()].signal(&self.backend)
    }

    /// 让 `waiter` 队列在 GPU 上等待 `signaler` 队列的栅栏到达 `value`
    pub fn queue_wait(&self, waiter: QueueType, signaler: QueueType, value: FenceValue) -> Result<()> {
        let waiting = &self.queues[waiter.index()];
        let signaling = &self.queues[signaler.index()];
        rhi_ensure!(
            value <= signaling.last_signaled(),
            "{} queue waits for value {} that {} queue never signaled",
            waiter,
            value,
            signaler
        );
        waiting.wait_for(&self.backend, signaling, value)
    }

    // ---- 帧循环 ----

    /// 开始一帧
    ///
    /// 等待 `buffered_frames` 帧之前结束的那一帧的信号，然后推进延迟删除队列。
    pub fn begin_frame(&mut self) -> Result<()> {
        let slot = (self.frame_index % self.frame_syncs.len() as u64) as usize;
        for sync in std::mem::take(&mut self.frame_syncs[slot]) {
            sync.wait(self.fence_timeout)?;
        }

        let finalized = self.deletion.tick(|item| {
            release(
                &self.backend,
                &mut self.resources,
                &mut self.descriptors,
                &mut self.resource_states,
                &mut self.pending_destroy,
                item,
            )
        });
        self.descriptors.heap_mut(DescriptorHeapType::CbvSrvUav).reclaim_temporary();
        self.descriptors.heap_mut(DescriptorHeapType::Sampler).reclaim_temporary();

        trace!(frame = self.frame_index, finalized, "Frame begun");
        Ok(())
    }

    /// 结束一帧，在每个队列上追加信号
    pub fn end_frame(&mut self) -> Result<()> {
        let slot = (self.frame_index % self.frame_syncs.len() as u64) as usize;
        let mut syncs = Vec::with_capacity(self.queues.len());
        for queue in &mut self.queues {
            syncs.push(queue.signal(&self.backend)?);
        }
        self.frame_syncs[slot] = syncs;
        self.frame_index += 1;
        Ok(())
    }

    /// 等待所有队列空闲
    pub fn wait_idle(&mut self) -> Result<()> {
        for queue in &mut self.queues {
            queue.wait_idle(&self.backend)?;
        }
        self.backend.wait_idle()
    }

    /// 关闭设备
    ///
    /// 等待 GPU 空闲，销毁所有延迟删除的对象；仍然存活的资源视为泄漏，
    /// 销毁后返回 `RhiError::ResourceLeak`。
    pub fn shutdown(mut self) -> Result<()> {
        let result = self.teardown();
        self.shut_down = true;
        result
    }

    fn teardown(&mut self) -> Result<()> {
        info!(frame = self.frame_index, "Shutting down device");
        let idle = self.wait_idle();
        if let Err(err) = &idle {
            error!(error = %err, "wait_idle failed during shutdown, releasing anyway");
        }

        let drained = self.deletion.force_drain(|item| {
            release(
                &self.backend,
                &mut self.resources,
                &mut self.descriptors,
                &mut self.resource_states,
                &mut self.pending_destroy,
                item,
            )
        });
        debug!(drained, "Deferred deletions drained");

        let live = self.resources.live_counts();
        let samplers = self.descriptors.heap(DescriptorHeapType::Sampler).stats().persistent_used;
        let leak = (live.total() > 0 || samplers > 0).then(|| {
            format!(
                "{} buffers, {} textures, {} shaders, {} pipelines, {} samplers still alive at shutdown",
                live.buffers, live.textures, live.shaders, live.pipelines, samplers
            )
        });

        for (_, pipeline) in self.resources.pipelines.drain() {
            self.backend.destroy_pipeline(pipeline.raw);
        }
        for (_, shader) in self.resources.shaders.drain() {
            self.backend.destroy_shader(shader.raw);
        }
        for (_, buffer) in self.resources.buffers.drain() {
            for slot in buffer.views.iter() {
                self.descriptors.free_persistent(slot);
            }
            self.backend.destroy_buffer(buffer.raw);
        }
        for (_, texture) in self.resources.textures.drain() {
            for slot in texture.views.iter() {
                self.descriptors.free_persistent(slot);
            }
            self.backend.destroy_texture(texture.raw);
        }
        if let Some(upload) = self.upload_buffer.take() {
            self.backend.destroy_buffer(upload);
        }
        for queue in self.queues.drain(..) {
            queue.destroy(&self.backend);
        }
        for heap in self.raw_heaps.drain(..) {
            self.backend.destroy_descriptor_heap(heap);
        }

        idle?;
        if let Some(message) = leak {
            error!("{}", message);
            return Err(RhiError::ResourceLeak(message));
        }
        info!("Device shut down");
        Ok(())
    }
}

impl<B: RenderBackend> Drop for Device<B> {
    fn drop(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            if let Err(err) = self.teardown() {
                error!(error = %err, "Device dropped without shutdown");
            }
        }
    }
}

/// 真正销毁一个到期的对象
fn release<B: RenderBackend>(
    backend: &B,
    resources: &mut ResourcePools<B>,
    descriptors: &mut DescriptorManager,
    states: &mut GlobalResourceStates,
    pending: &mut HashSet<PendingKey>,
    item: PendingRelease<B>,
) {
    let key = item.key();
    if let PendingKey::Resource(resource) = key {
        states.forget(resource);
    }
    pending.remove(&key);
    match item {
        PendingRelease::Buffer(handle) => {
            if let Some(buffer) = resources.buffers.delete(handle) {
                for slot in buffer.views.iter() {
                    descriptors.free_persistent(slot);
                }
                backend.destroy_buffer(buffer.raw);
                trace!(handle = %handle, "Buffer released");
            }
        }
        PendingRelease::Texture(handle) => {
            if let Some(texture) = resources.textures.delete(handle) {
                for slot in texture.views.iter() {
                    descriptors.free_persistent(slot);
                }
                backend.destroy_texture(texture.raw);
                trace!(handle = %handle, "Texture released");
            }
        }
        PendingRelease::Shader(handle) => {
            if let Some(shader) = resources.shaders.delete(handle) {
                backend.destroy_shader(shader.raw);
            }
        }
        PendingRelease::Pipeline(handle) => {
            if let Some(pipeline) = resources.pipelines.delete(handle) {
                backend.destroy_pipeline(pipeline.raw);
            }
        }
        PendingRelease::Sampler(slot) => descriptors.free_persistent(&slot),
    }
}

fn require_usage<T>(ok: bool, what: &str, handle: super::handle::Handle<T>) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(RhiError::CommandRecording(format!("{} is not usable as a {}", handle, what)))
    }
}

fn mapped_range<B: RenderBackend>(buffer: &Buffer<B>, offset: u64, len: u64) -> Result<*mut u8> {
    let Some(base) = buffer.mapped_ptr() else {
        return Err(RhiError::ContractViolation(format!(
            "{:?} buffer has no CPU mapping",
            buffer.desc.memory_type
        )));
    };
    match offset.checked_add(len) {
        // SAFETY: offset + len 不超过映射长度
        Some(end) if end <= buffer.desc.size => Ok(unsafe { base.as_ptr().add(offset as usize) }),
        _ => Err(RhiError::ContractViolation(format!(
            "range [{}, {}+{}) exceeds buffer size {}",
            offset, offset, len, buffer.desc.size
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HeapCapacity;
    use crate::gfx::null::NullBackend;
    use crate::renderer::resource::TextureFormat;

    fn config() -> Config {
        let mut config = Config::default();
        config.device.buffered_frames = 3;
        config.upload.ring_buffer_size = 64 * 1024;
        config
    }

    #[test]
    fn test_default_views() {
        let mut device = Device::new(NullBackend::new(), &config()).unwrap();
        let cb = device.create_buffer(&BufferDescriptor::uniform(100)).unwrap();
        let sb = device.create_buffer(&BufferDescriptor::structured(8, 16)).unwrap();

        let cb_obj = device.buffer(cb).unwrap();
        assert_eq!(cb_obj.descriptor().size, 256);
        assert!(cb_obj.cbv_index().is_some());
        assert!(cb_obj.srv_index().is_none());

        let sb_obj = device.buffer(sb).unwrap();
        assert!(sb_obj.srv_index().is_some());
        assert!(sb_obj.uav_index().is_some());
        assert_ne!(sb_obj.srv_index(), sb_obj.uav_index());

        let stats = &device.descriptor_stats()[DescriptorHeapType::CbvSrvUav.index()];
        assert_eq!(stats.persistent_used, 3);

        device.destroy_buffer(cb);
        device.destroy_buffer(sb);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_deferred_destroy_waits_buffered_frames() {
        let mut device = Device::new(NullBackend::new(), &config()).unwrap();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                16,
                16,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED | TextureUsage::RENDER_TARGET,
            ))
            .unwrap();

        device.begin_frame().unwrap();
        device.destroy_texture(texture);
        device.end_frame().unwrap();

        for _ in 0..2 {
            device.begin_frame().unwrap();
            // 仍在延迟队列中，句柄可以解析
            assert!(device.texture(texture).is_ok());
            device.end_frame().unwrap();
        }

        device.begin_frame().unwrap();
        assert!(device.texture(texture).is_err());
        assert_eq!(device.pending_deletions(), 0);
        let rtv = &device.descriptor_stats()[DescriptorHeapType::Rtv.index()];
        assert_eq!(rtv.persistent_used, 0);
        device.end_frame().unwrap();

        device.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_drains_pending_deletions() {
        let mut device = Device::new(NullBackend::new(), &config()).unwrap();
        let buffer = device.create_buffer(&BufferDescriptor::structured(4, 4)).unwrap();
        let sampler = device.create_sampler(&SamplerDescriptor::default()).unwrap();
        device.destroy_buffer(buffer);
        device.destroy_sampler(sampler);
        assert_eq!(device.pending_deletions(), 2);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_reports_leaks() {
        let mut device = Device::new(NullBackend::new(), &config()).unwrap();
        let _leaked = device.create_buffer(&BufferDescriptor::uniform(64)).unwrap();
        let err = device.shutdown().unwrap_err();
        assert!(matches!(err, RhiError::ResourceLeak(ref msg) if msg.starts_with("1 buffers")));
    }

    #[test]
    fn test_stale_handle_after_release() {
        let mut config = config();
        config.device.buffered_frames = 1;
        config.pools.buffers = 1;
        let mut device = Device::new(NullBackend::new(), &config).unwrap();

        let first = device.create_buffer(&BufferDescriptor::structured(4, 4)).unwrap();
        device.destroy_buffer(first);
        device.end_frame().unwrap();
        device.begin_frame().unwrap();

        let second = device.create_buffer(&BufferDescriptor::structured(4, 4)).unwrap();
        // 槽位复用，代数不同
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(device.buffer(first).is_err());

        device.destroy_buffer(second);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_descriptor_exhaustion() {
        let mut config = config();
        config.descriptors.cbv_srv_uav = HeapCapacity::new(2, 16);
        let mut device = Device::new(NullBackend::new(), &config).unwrap();

        let a = device.create_buffer(&BufferDescriptor::structured(4, 4)).unwrap();
        let err = device.create_buffer(&BufferDescriptor::structured(4, 4)).unwrap_err();
        assert!(matches!(err, RhiError::DescriptorHeapExhausted { .. }));
        // 失败的创建不残留任何对象
        assert_eq!(device.resources().live_counts().buffers, 1);

        device.destroy_buffer(a);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_write_and_read_upload_buffer() {
        let mut device = Device::new(NullBackend::new(), &config()).unwrap();
        let upload = device
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::COPY_SRC, MemoryType::Upload))
            .unwrap();
        device.write_buffer(upload, 4, &[9, 8, 7]).unwrap();
        assert_eq!(device.read_buffer(upload, 4, 3).unwrap(), vec![9, 8, 7]);
        assert!(device.write_buffer(upload, 15, &[1, 2]).is_err());

        let local = device.create_buffer(&BufferDescriptor::structured(4, 4)).unwrap();
        assert!(device.write_buffer(local, 0, &[1]).is_err());

        device.destroy_buffer(upload);
        device.destroy_buffer(local);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_frame_fence_wait_times_out_as_device_lost() {
        let mut config = config();
        config.device.buffered_frames = 1;
        config.device.fence_timeout_ms = Some(5);
        let backend = NullBackend::with_manual_completion();
        let mut device = Device::new(backend, &config).unwrap();

        device.begin_frame().unwrap();
        device.end_frame().unwrap();
        // GPU 从未完成上一帧
        let err = device.begin_frame().unwrap_err();
        assert!(err.is_device_lost());

        device.backend().complete_all();
        device.begin_frame().unwrap();
        // 关闭时的 wait_idle 追加的新信号同样不会完成
        assert!(device.shutdown().unwrap_err().is_device_lost());
    }

    #[test]
    fn test_cross_queue_wait() {
        let mut device = Device::new(NullBackend::new(), &config()).unwrap();
        let sync = device.signal(QueueType::Copy).unwrap();
        device.queue_wait(QueueType::Direct, QueueType::Copy, sync.value()).unwrap();
        device.shutdown().unwrap();
    }
}
