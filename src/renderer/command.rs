//! 命令队列与命令上下文
//!
//! - [`CommandQueue`]：拥有原生队列和一个时间线栅栏，负责提交、信号和命令列表复用
//! - [`CommandContext`]：一次录制会话，内含自己的资源状态跟踪器，
//!   记录屏障、拷贝、上传和计算分派，最后交给 `Device::execute` 提交
//!
//! # 命令列表复用
//!
//! 提交后的命令列表连同它的同步点一起放回空闲队列；请求新列表时优先复用已完成的，
//! 未达到上限时新建，否则阻塞等待最早提交的那个。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::core::error::{Result, RhiError};

use super::backend_trait::{RawResource, RenderBackend, ResolvedBarrier};
use super::descriptor::{DescriptorHandle, DescriptorHeapType};
use super::device::Device;
use super::resource::{
    BindGroup, BindGroupEntry, Buffer, BufferHandle, PipelineHandle, TextureFootprint, TextureHandle,
    TEXTURE_PLACEMENT_ALIGNMENT,
};
use super::ring_buffer::RingAllocation;
use super::state::{Barrier, ResourceKey, ResourceState, ResourceStateTracker, Subresource};
use super::sync::{FenceValue, GpuFence, SyncPoint};

/// 命令队列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// 直接队列（图形、计算、拷贝）
    Direct,
    /// 计算队列（计算、拷贝）
    Compute,
    /// 拷贝队列（仅拷贝）
    Copy,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Direct, QueueType::Compute, QueueType::Copy];

    pub fn index(self) -> usize {
        match self {
            QueueType::Direct => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueType::Direct => "direct",
            QueueType::Compute => "compute",
            QueueType::Copy => "copy",
        }
    }

    /// 是否可以执行计算分派
    pub fn supports_compute(self) -> bool {
        !matches!(self, QueueType::Copy)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 命令上下文标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// 命令列表状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// 正在记录
    Recording,
    /// 已完成记录
    Executable,
    /// 已提交，等待 GPU 完成
    Pending,
    /// 录制失败，只能丢弃
    Invalid,
}

/// 命令队列
///
/// 每个队列拥有一个栅栏，`signal` 返回的同步点在队列执行到该位置时完成。
pub struct CommandQueue<B: RenderBackend> {
    queue_type: QueueType,
    raw: B::Queue,
    fence: Arc<B::Fence>,
    last_signaled: FenceValue,
    idle_lists: VecDeque<(B::CommandList, SyncPoint)>,
    created_lists: u32,
    max_lists: u32,
    wait_timeout: Option<Duration>,
}

impl<B: RenderBackend> CommandQueue<B> {
    pub fn new(backend: &B, queue_type: QueueType, max_lists: u32, wait_timeout: Option<Duration>) -> Result<Self> {
        let raw = backend.create_queue(queue_type)?;
        let fence = Arc::new(backend.create_fence(0)?);
        debug!(queue = %queue_type, max_lists, "Command queue created");
        Ok(Self {
            queue_type,
            raw,
            fence,
            last_signaled: FenceValue::new(0),
            idle_lists: VecDeque::new(),
            created_lists: 0,
            max_lists: max_lists.max(1),
            wait_timeout,
        })
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn raw(&self) -> &B::Queue {
        &self.raw
    }

    pub fn fence(&self) -> &B::Fence {
        &self.fence
    }

    /// 最近一次信号的值
    pub fn last_signaled(&self) -> FenceValue {
        self.last_signaled
    }

    /// GPU 已完成的栅栏值
    pub fn completed_value(&self) -> u64 {
        self.fence.completed_value()
    }

    /// 已创建的命令列表数量
    pub fn created_lists(&self) -> u32 {
        self.created_lists
    }

    /// 构造本队列栅栏上的同步点
    pub fn sync_point(&self, value: FenceValue) -> SyncPoint {
        let fence: Arc<dyn GpuFence> = self.fence.clone();
        SyncPoint::new(fence, value)
    }

    /// 在队列上追加一次信号
    pub fn signal(&mut self, backend: &B) -> Result<SyncPoint> {
        let value = self.last_signaled.next();
        backend.queue_signal(&self.raw, &self.fence, value.value())?;
        self.last_signaled = value;
        trace!(queue = %self.queue_type, fence = %value, "Queue signaled");
        Ok(self.sync_point(value))
    }

    /// 提交命令列表并返回它的完成同步点
    pub fn submit(&mut self, backend: &B, list: &B::CommandList) -> Result<SyncPoint> {
        backend.submit(&self.raw, list)?;
        self.signal(backend)
    }

    /// 让本队列在 GPU 上等待另一队列的栅栏
    pub fn wait_for(&self, backend: &B, other: &CommandQueue<B>, value: FenceValue) -> Result<()> {
        backend.queue_wait(&self.raw, &other.fence, value.value())
    }

    /// 取一个可以开始录制的命令列表
    pub fn request_command_list(&mut self, backend: &B) -> Result<B::CommandList> {
        if let Some(pos) = self.idle_lists.iter().position(|(_, sync)| sync.is_complete()) {
            if let Some((list, _)) = self.idle_lists.remove(pos) {
                return Ok(list);
            }
        }

        if self.created_lists < self.max_lists {
            let list = backend.create_command_list(self.queue_type)?;
            self.created_lists += 1;
            debug!(queue = %self.queue_type, created = self.created_lists, "Command list created");
            return Ok(list);
        }

        match self.idle_lists.pop_front() {
            Some((list, sync)) => {
                warn!(
                    queue = %self.queue_type,
                    fence = %sync.value(),
                    "All command lists in flight, stalling on oldest submission"
                );
                if let Err(err) = sync.wait(self.wait_timeout) {
                    self.idle_lists.push_front((list, sync));
                    return Err(err);
                }
                Ok(list)
            }
            None => Err(RhiError::CommandRecording(format!(
                "all {} {} command lists are currently recording",
                self.max_lists, self.queue_type
            ))),
        }
    }

    /// 归还命令列表，`sync` 完成后可复用
    pub fn recycle(&mut self, list: B::CommandList, sync: SyncPoint) {
        self.idle_lists.push_back((list, sync));
    }

    /// 等待队列上已提交的所有工作完成
    pub fn wait_idle(&mut self, backend: &B) -> Result<()> {
        let sync = self.signal(backend)?;
        sync.wait(self.wait_timeout)
    }

    /// 销毁空闲的命令列表，调用前必须已经 `wait_idle`
    pub fn destroy(mut self, backend: &B) {
        let idle = self.idle_lists.len() as u32;
        for (list, _) in self.idle_lists.drain(..) {
            backend.destroy_command_list(list);
        }
        if idle < self.created_lists {
            warn!(
                queue = %self.queue_type,
                outstanding = self.created_lists - idle,
                "Command queue destroyed while command lists are still recording"
            );
        }
        debug!(queue = %self.queue_type, "Command queue destroyed");
    }
}

/// 命令上下文中引用的资源
pub enum ResourceHandle<B: RenderBackend> {
    Buffer(BufferHandle<B>),
    Texture(TextureHandle<B>),
}

impl<B: RenderBackend> From<BufferHandle<B>> for ResourceHandle<B> {
    fn from(handle: BufferHandle<B>) -> Self {
        ResourceHandle::Buffer(handle)
    }
}

impl<B: RenderBackend> From<TextureHandle<B>> for ResourceHandle<B> {
    fn from(handle: TextureHandle<B>) -> Self {
        ResourceHandle::Texture(handle)
    }
}

/// 命令上下文
///
/// 一次录制会话。所有操作都显式接收设备引用；上下文结束时交给
/// `Device::execute` 提交，或交给 `Device::discard` 丢弃。
pub struct CommandContext<B: RenderBackend> {
    id: ContextId,
    queue_type: QueueType,
    list: Option<B::CommandList>,
    state: CommandListState,
    tracker: ResourceStateTracker,
    temp_descriptors: Vec<DescriptorHandle>,
    uploads: Vec<RingAllocation>,
    pipeline: Option<PipelineHandle<B>>,
    table: Option<DescriptorHandle>,
    dispatches: u32,
}

impl<B: RenderBackend> CommandContext<B> {
    pub(crate) fn new(id: ContextId, queue_type: QueueType, list: B::CommandList) -> Self {
        Self {
            id,
            queue_type,
            list: Some(list),
            state: CommandListState::Recording,
            tracker: ResourceStateTracker::new(queue_type),
            temp_descriptors: Vec::new(),
            uploads: Vec::new(),
            pipeline: None,
            table: None,
            dispatches: 0,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    /// 本上下文记录的分派次数
    pub fn dispatch_count(&self) -> u32 {
        self.dispatches
    }

    /// 请求缓冲区或整张纹理进入某个状态
    pub fn transition(
        &mut self,
        device: &Device<B>,
        resource: impl Into<ResourceHandle<B>>,
        state: ResourceState,
    ) -> Result<()> {
        self.ensure_recording()?;
        match resource.into() {
            ResourceHandle::Buffer(handle) => {
                let buffer = device.resources().buffer(handle)?;
                self.require_buffer_state(buffer, state)
            }
            ResourceHandle::Texture(handle) => {
                let texture = device.resources().texture(handle)?;
                self.tracker.insert_barrier(texture, state, Subresource::All);
                Ok(())
            }
        }
    }

    /// 请求纹理的单个子资源进入某个状态
    pub fn transition_subresource(
        &mut self,
        device: &Device<B>,
        texture: TextureHandle<B>,
        mip: u32,
        layer: u32,
        state: ResourceState,
    ) -> Result<()> {
        self.ensure_recording()?;
        let texture = device.resources().texture(texture)?;
        let desc = texture.descriptor();
        if mip >= desc.mip_levels || layer >= desc.array_layers() {
            return Err(RhiError::CommandRecording(format!(
                "subresource (mip {}, layer {}) out of range for texture with {} mips and {} layers",
                mip,
                layer,
                desc.mip_levels,
                desc.array_layers()
            )));
        }
        let index = desc.subresource_index(mip, layer);
        self.tracker.insert_barrier(texture, state, Subresource::Index(index));
        Ok(())
    }

    /// 读写冒险屏障，`None` 表示所有 UAV 访问
    pub fn uav_barrier(&mut self, device: &Device<B>, resource: Option<ResourceHandle<B>>) -> Result<()> {
        self.ensure_recording()?;
        match resource {
            None => self.tracker.insert_uav_barrier(None),
            Some(ResourceHandle::Buffer(handle)) => {
                let buffer = device.resources().buffer(handle)?;
                self.tracker.insert_uav_barrier(Some(buffer));
            }
            Some(ResourceHandle::Texture(handle)) => {
                let texture = device.resources().texture(handle)?;
                self.tracker.insert_uav_barrier(Some(texture));
            }
        }
        Ok(())
    }

    /// 把待提交的屏障写入命令列表
    pub fn flush_barriers(&mut self, device: &Device<B>) -> Result<()> {
        self.ensure_recording()?;
        let Some(list) = self.list.as_mut() else {
            return Err(RhiError::CommandRecording("context has no command list".to_string()));
        };
        let backend = device.backend();
        let resources = device.resources();
        self.tracker.submit_barriers(|barriers| {
            let resolved: Vec<ResolvedBarrier<'_, B>> =
                barriers.iter().filter_map(|b| resolve_barrier(resources, b)).collect();
            if !resolved.is_empty() {
                backend.cmd_resource_barriers(list, &resolved);
            }
            Ok::<(), RhiError>(())
        })
    }

    /// 缓冲区之间拷贝
    pub fn copy_buffer(
        &mut self,
        device: &Device<B>,
        src: BufferHandle<B>,
        src_offset: u64,
        dst: BufferHandle<B>,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.ensure_recording()?;
        let src_buffer = device.resources().buffer(src)?;
        let dst_buffer = device.resources().buffer(dst)?;
        check_range("source", src_offset, size, src_buffer.descriptor().size)?;
        check_range("destination", dst_offset, size, dst_buffer.descriptor().size)?;

        self.require_buffer_state(src_buffer, ResourceState::COPY_SOURCE)?;
        self.require_buffer_state(dst_buffer, ResourceState::COPY_DEST)?;
        self.flush_barriers(device)?;

        let list = self.list_mut()?;
        device
            .backend()
            .cmd_copy_buffer(list, src_buffer.raw(), src_offset, dst_buffer.raw(), dst_offset, size);
        Ok(())
    }

    /// 经由上传环形缓冲区把数据写入缓冲区
    pub fn upload_buffer(
        &mut self,
        device: &mut Device<B>,
        dst: BufferHandle<B>,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_recording()?;
        let size = data.len() as u64;
        {
            let dst_buffer = device.resources().buffer(dst)?;
            check_range("destination", dst_offset, size, dst_buffer.descriptor().size)?;
        }

        let mut allocation = device.upload_ring_mut().allocate(size)?;
        allocation.owner = Some(self.id);
        device.upload_ring_mut().write(&allocation, 0, data)?;
        let src_offset = allocation.offset;
        self.uploads.push(allocation);

        let dst_buffer = device.resources().buffer(dst)?;
        self.require_buffer_state(dst_buffer, ResourceState::COPY_DEST)?;
        self.flush_barriers(device)?;

        let upload = device.upload_buffer_raw()?;
        let list = self.list_mut()?;
        device
            .backend()
            .cmd_copy_buffer(list, upload, src_offset, dst_buffer.raw(), dst_offset, size);
        trace!(ctx = %self.id, size, "Buffer upload recorded");
        Ok(())
    }

    /// 上传纹理的一个子资源
    ///
    /// `data` 为紧密排列的像素，行距按 256 字节对齐后写入环形缓冲区。
    pub fn upload_texture(
        &mut self,
        device: &mut Device<B>,
        dst: TextureHandle<B>,
        mip: u32,
        layer: u32,
        data: &[u8],
    ) -> Result<()> {
        self.ensure_recording()?;
        let (mut footprint, format) = {
            let texture = device.resources().texture(dst)?;
            let desc = texture.descriptor();
            if mip >= desc.mip_levels || layer >= desc.array_layers() {
                return Err(RhiError::CommandRecording(format!(
                    "upload target (mip {}, layer {}) out of range",
                    mip, layer
                )));
            }
            (TextureFootprint::for_subresource(desc, mip, layer), desc.format)
        };

        let row_bytes = footprint.row_bytes(format);
        let rows = u64::from(footprint.height) * u64::from(footprint.depth);
        if data.len() as u64 != row_bytes * rows {
            return Err(RhiError::CommandRecording(format!(
                "texture upload expects {} bytes, got {}",
                row_bytes * rows,
                data.len()
            )));
        }

        let mut allocation = device
            .upload_ring_mut()
            .allocate_aligned(footprint.total_size(), TEXTURE_PLACEMENT_ALIGNMENT)?;
        allocation.owner = Some(self.id);
        for (row, chunk) in data.chunks(row_bytes as usize).enumerate() {
            device
                .upload_ring_mut()
                .write(&allocation, row as u64 * footprint.row_pitch, chunk)?;
        }
        footprint.buffer_offset = allocation.offset;
        self.uploads.push(allocation);

        self.transition_subresource(device, dst, mip, layer, ResourceState::COPY_DEST)?;
        self.flush_barriers(device)?;

        let texture = device.resources().texture(dst)?;
        let upload = device.upload_buffer_raw()?;
        let list = self.list_mut()?;
        device
            .backend()
            .cmd_copy_buffer_to_texture(list, upload, &footprint, texture.raw(), texture.descriptor());
        Ok(())
    }

    /// 设置计算管线，之前绑定的资源表失效
    pub fn set_compute_pipeline(&mut self, device: &Device<B>, pipeline: PipelineHandle<B>) -> Result<()> {
        self.ensure_recording()?;
        if !self.queue_type.supports_compute() {
            return Err(RhiError::CommandRecording(format!(
                "{} queue cannot record compute work",
                self.queue_type
            )));
        }
        device.resources().pipeline(pipeline)?;
        self.pipeline = Some(pipeline);
        self.table = None;
        Ok(())
    }

    /// 按管线布局把资源写入一张临时描述符表，并请求相应的资源状态
    pub fn bind_compute_resources(&mut self, device: &mut Device<B>, group: &BindGroup<B>) -> Result<()> {
        self.ensure_recording()?;
        let Some(pipeline) = self.pipeline else {
            return Err(RhiError::CommandRecording(
                "bind_compute_resources called before set_compute_pipeline".to_string(),
            ));
        };
        let count = {
            let layout = device.resources().pipeline(pipeline)?.layout();
            group.validate(layout)?;
            layout.descriptor_count()
        };
        if count == 0 {
            self.table = None;
            return Ok(());
        }

        let table = device
            .descriptors_mut()
            .allocate_temporary(DescriptorHeapType::CbvSrvUav, count)?;
        self.temp_descriptors.push(table);

        let increment = device.descriptors().heap(DescriptorHeapType::CbvSrvUav).increment_size();
        for (i, entry) in group.entries.iter().enumerate() {
            let slot = table.element(i as u32, increment);
            device.write_bind_entry(&slot, entry)?;
        }

        for entry in &group.entries {
            let state = entry.kind().compute_state();
            match entry {
                BindGroupEntry::ConstantBuffer(h)
                | BindGroupEntry::BufferRead(h)
                | BindGroupEntry::BufferReadWrite(h) => {
                    let buffer = device.resources().buffer(*h)?;
                    self.require_buffer_state(buffer, state)?;
                }
                BindGroupEntry::TextureRead(h) => {
                    let texture = device.resources().texture(*h)?;
                    self.tracker.insert_barrier(texture, state, Subresource::All);
                }
                BindGroupEntry::TextureReadWrite(h, mip) => {
                    let texture = device.resources().texture(*h)?;
                    let desc = texture.descriptor();
                    for layer in 0..desc.array_layers() {
                        let index = desc.subresource_index(*mip, layer);
                        self.tracker.insert_barrier(texture, state, Subresource::Index(index));
                    }
                }
            }
        }

        self.table = Some(table);
        Ok(())
    }

    /// 计算分派
    pub fn dispatch(&mut self, device: &Device<B>, x: u32, y: u32, z: u32) -> Result<()> {
        self.ensure_recording()?;
        let Some(pipeline) = self.pipeline else {
            return Err(RhiError::CommandRecording("dispatch without a compute pipeline".to_string()));
        };
        let pipeline = device.resources().pipeline(pipeline)?;
        if pipeline.layout().descriptor_count() > 0 && self.table.is_none() {
            return Err(RhiError::CommandRecording(
                "dispatch without bound resources for a pipeline that declares bindings".to_string(),
            ));
        }
        self.flush_barriers(device)?;

        let table = self.table;
        let list = self.list_mut()?;
        let backend = device.backend();
        backend.cmd_bind_compute(
            list,
            &pipeline.raw,
            device.raw_heap(DescriptorHeapType::CbvSrvUav),
            device.raw_heap(DescriptorHeapType::Sampler),
            table.as_ref(),
        );
        backend.cmd_dispatch(list, x, y, z);
        self.dispatches += 1;
        Ok(())
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.state != CommandListState::Recording {
            return Err(RhiError::CommandRecording(format!(
                "{} is not recording (state {:?})",
                self.id, self.state
            )));
        }
        Ok(())
    }

    fn list_mut(&mut self) -> Result<&mut B::CommandList> {
        self.list
            .as_mut()
            .ok_or_else(|| RhiError::CommandRecording("context has no command list".to_string()))
    }

    /// 上传堆和读回堆的缓冲区状态固定，不参与跟踪
    fn require_buffer_state(&mut self, buffer: &Buffer<B>, state: ResourceState) -> Result<()> {
        match buffer.descriptor().fixed_state() {
            Some(fixed) if fixed.contains(state) => Ok(()),
            Some(fixed) => Err(RhiError::CommandRecording(format!(
                "{:?} buffer is fixed in {:?} and cannot be used as {:?}",
                buffer.descriptor().memory_type,
                fixed,
                state
            ))),
            None => {
                self.tracker.insert_barrier(buffer, state, Subresource::All);
                Ok(())
            }
        }
    }

    /// 结束录制，取出命令列表和需要随提交释放的临时分配
    pub(crate) fn finish(&mut self, device: &Device<B>) -> Result<ContextParts<B>> {
        if self.state == CommandListState::Recording {
            if let Err(err) = self.flush_barriers(device) {
                self.state = CommandListState::Invalid;
                return Err(err);
            }
            let list = self.list_mut()?;
            if let Err(err) = device.backend().end_command_list(list) {
                self.state = CommandListState::Invalid;
                return Err(err);
            }
            self.state = CommandListState::Executable;
        }
        let list = self
            .list
            .take()
            .ok_or_else(|| RhiError::CommandRecording(format!("{} was already finished", self.id)))?;
        Ok(ContextParts {
            list,
            temp_descriptors: std::mem::take(&mut self.temp_descriptors),
            uploads: std::mem::take(&mut self.uploads),
        })
    }

    /// 丢弃时不需要结束录制，只取出命令列表和临时分配
    pub(crate) fn abandon(&mut self) -> Option<ContextParts<B>> {
        self.state = CommandListState::Invalid;
        self.list.take().map(|list| ContextParts {
            list,
            temp_descriptors: std::mem::take(&mut self.temp_descriptors),
            uploads: std::mem::take(&mut self.uploads),
        })
    }

    pub(crate) fn mark_pending(&mut self) {
        self.state = CommandListState::Pending;
    }

    pub(crate) fn is_executable(&self) -> bool {
        self.state == CommandListState::Executable
    }
}

impl<B: RenderBackend> Drop for CommandContext<B> {
    fn drop(&mut self) {
        if self.list.is_some() {
            warn!(
                ctx = %self.id,
                queue = %self.queue_type,
                "Command context dropped without execute or discard, command list leaked"
            );
        }
    }
}

/// 结束录制后交给设备的部分
pub(crate) struct ContextParts<B: RenderBackend> {
    pub list: B::CommandList,
    pub temp_descriptors: Vec<DescriptorHandle>,
    pub uploads: Vec<RingAllocation>,
}

fn check_range(what: &str, offset: u64, size: u64, capacity: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(RhiError::CommandRecording(format!(
            "{} range [{}, {}+{}) exceeds buffer size {}",
            what, offset, offset, size, capacity
        ))),
    }
}

fn raw_resource<'a, B: RenderBackend>(
    resources: &'a super::resource::ResourcePools<B>,
    key: ResourceKey,
) -> Option<RawResource<'a, B>> {
    match key {
        ResourceKey::Buffer(bits) => resources
            .buffer_by_key(bits)
            .map(|b| RawResource::Buffer(b.raw(), b.descriptor())),
        ResourceKey::Texture(bits) => resources
            .texture_by_key(bits)
            .map(|t| RawResource::Texture(t.raw(), t.descriptor())),
    }
}

pub(crate) fn resolve_barrier<'a, B: RenderBackend>(
    resources: &'a super::resource::ResourcePools<B>,
    barrier: &Barrier,
) -> Option<ResolvedBarrier<'a, B>> {
    match *barrier {
        Barrier::Transition {
            resource,
            subresource,
            before,
            after,
        } => match raw_resource(resources, resource) {
            Some(raw) => Some(ResolvedBarrier::Transition {
                resource: raw,
                subresource,
                before,
                after,
            }),
            None => {
                warn!(resource = %resource, "Barrier references a destroyed resource, skipped");
                None
            }
        },
        Barrier::Uav { resource: None } => Some(ResolvedBarrier::Uav { resource: None }),
        Barrier::Uav { resource: Some(key) } => {
            raw_resource(resources, key).map(|raw| ResolvedBarrier::Uav { resource: Some(raw) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::gfx::null::{NullBackend, NullCommand};
    use crate::renderer::state::TrackedResource;
    use crate::renderer::resource::{
        BindingLayout, BufferDescriptor, BufferUsage, MemoryType, ShaderDescriptor, TextureDescriptor, TextureFormat,
        TextureUsage,
    };

    fn device() -> Device<NullBackend> {
        Device::new(NullBackend::new(), &Config::default()).unwrap()
    }

    #[test]
    fn test_queue_signal_values_increase() {
        let backend = NullBackend::new();
        let mut queue = CommandQueue::new(&backend, QueueType::Direct, 2, None).unwrap();
        let a = queue.signal(&backend).unwrap();
        let b = queue.signal(&backend).unwrap();
        assert_eq!(a.value().value(), 1);
        assert_eq!(b.value().value(), 2);
        assert!(b.is_complete());
        queue.destroy(&backend);
    }

    #[test]
    fn test_command_list_reuse() {
        let backend = NullBackend::new();
        let mut queue = CommandQueue::new(&backend, QueueType::Copy, 1, None).unwrap();

        let list = queue.request_command_list(&backend).unwrap();
        // 唯一的列表正在录制
        assert!(queue.request_command_list(&backend).is_err());

        let sync = queue.submit(&backend, &list).unwrap();
        queue.recycle(list, sync);
        let reused = queue.request_command_list(&backend).unwrap();
        assert_eq!(queue.created_lists(), 1);
        let sync = queue.signal(&backend).unwrap();
        queue.recycle(reused, sync);
        queue.destroy(&backend);
    }

    #[test]
    fn test_copy_records_barriers_then_copy() {
        let mut device = device();
        let usage = BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let src = device
            .create_buffer(&BufferDescriptor::new(64, usage, MemoryType::DeviceLocal))
            .unwrap();
        let dst = device
            .create_buffer(&BufferDescriptor::new(64, usage, MemoryType::DeviceLocal))
            .unwrap();

        let mut ctx = device.context(QueueType::Direct).unwrap();
        ctx.copy_buffer(&device, src, 0, dst, 0, 64).unwrap();
        // 首次使用靠提升，无需屏障
        assert_eq!(ctx.tracker().stats().promotions, 2);

        ctx.copy_buffer(&device, dst, 0, src, 0, 64).unwrap();
        device.execute(ctx).unwrap();

        let commands = device.backend().submitted_commands();
        let barriers = commands
            .iter()
            .filter(|c| matches!(c, NullCommand::Barriers { .. }))
            .count();
        let copies = commands
            .iter()
            .filter(|c| matches!(c, NullCommand::CopyBuffer { .. }))
            .count();
        assert_eq!(barriers, 1);
        assert_eq!(copies, 2);

        device.destroy_buffer(src);
        device.destroy_buffer(dst);
        device.shutdown().unwrap();
    }

    fn barrier_batches(device: &Device<NullBackend>) -> Vec<NullCommand> {
        device
            .backend()
            .submitted_commands()
            .into_iter()
            .filter(|c| matches!(c, NullCommand::Barriers { .. }))
            .collect()
    }

    #[test]
    fn test_state_carries_across_contexts() {
        let mut device = device();
        let usage = BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let a = device
            .create_buffer(&BufferDescriptor::new(64, usage, MemoryType::DeviceLocal))
            .unwrap();
        let b = device
            .create_buffer(&BufferDescriptor::new(64, usage, MemoryType::DeviceLocal))
            .unwrap();

        let mut ctx = device.context(QueueType::Copy).unwrap();
        ctx.copy_buffer(&device, a, 0, b, 0, 64).unwrap();
        device.execute(ctx).unwrap();
        assert!(barrier_batches(&device).is_empty());

        let mut ctx = device.context(QueueType::Copy).unwrap();
        ctx.copy_buffer(&device, b, 0, a, 0, 64).unwrap();
        assert_eq!(ctx.tracker().stats().promotions, 2);
        device.execute(ctx).unwrap();

        // 两个缓冲区的读写方向都反了，修正屏障合成一批
        let batches = barrier_batches(&device);
        assert_eq!(batches.len(), 1);
        assert!(matches!(batches[0], NullCommand::Barriers { transitions: 2, uav: 0 }));
        assert_eq!(device.stats().state_fixups, 2);

        let a_key = device.buffer(a).unwrap().resource_key();
        let b_key = device.buffer(b).unwrap().resource_key();
        let states = device.resource_states();
        assert_eq!(states.state(a_key, Subresource::All), Some(ResourceState::COPY_DEST));
        assert_eq!(states.state(b_key, Subresource::All), Some(ResourceState::COPY_SOURCE));

        // 状态一致时不再需要修正
        let mut ctx = device.context(QueueType::Copy).unwrap();
        ctx.copy_buffer(&device, b, 0, a, 0, 64).unwrap();
        device.execute(ctx).unwrap();
        assert_eq!(barrier_batches(&device).len(), 1);

        device.destroy_buffer(a);
        device.destroy_buffer(b);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_reset_state_skips_fixup() {
        let mut device = device();
        let usage = BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let a = device
            .create_buffer(&BufferDescriptor::new(64, usage, MemoryType::DeviceLocal))
            .unwrap();
        let b = device
            .create_buffer(&BufferDescriptor::new(64, usage, MemoryType::DeviceLocal))
            .unwrap();

        let mut ctx = device.context(QueueType::Copy).unwrap();
        ctx.copy_buffer(&device, a, 0, b, 0, 64).unwrap();
        device.execute(ctx).unwrap();

        device.buffer(a).unwrap().reset_state();
        device.buffer(b).unwrap().reset_state();
        let mut ctx = device.context(QueueType::Copy).unwrap();
        ctx.copy_buffer(&device, b, 0, a, 0, 64).unwrap();
        device.execute(ctx).unwrap();

        assert!(barrier_batches(&device).is_empty());
        assert_eq!(device.stats().state_fixups, 0);
        let a_key = device.buffer(a).unwrap().resource_key();
        assert_eq!(
            device.resource_states().state(a_key, Subresource::All),
            Some(ResourceState::COPY_DEST)
        );

        device.destroy_buffer(a);
        device.destroy_buffer(b);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_released_resource_state_is_forgotten() {
        let mut device = device();
        let buffer = device.create_buffer(&BufferDescriptor::structured(16, 4)).unwrap();
        let mut ctx = device.context(QueueType::Direct).unwrap();
        ctx.transition(&device, buffer, ResourceState::UNORDERED_ACCESS).unwrap();
        device.execute(ctx).unwrap();
        assert_eq!(device.resource_states().len(), 1);

        device.destroy_buffer(buffer);
        device.wait_idle().unwrap();
        for _ in 0..6 {
            device.begin_frame().unwrap();
            device.end_frame().unwrap();
        }
        assert!(device.resource_states().is_empty());
        device.shutdown().unwrap();
    }

    #[test]
    fn test_copy_out_of_range() {
        let mut device = device();
        let buffer = device.create_buffer(&BufferDescriptor::structured(4, 16)).unwrap();
        let mut ctx = device.context(QueueType::Copy).unwrap();
        let err = ctx.copy_buffer(&device, buffer, 32, buffer, 0, 64).unwrap_err();
        assert!(matches!(err, RhiError::CommandRecording(_)));
        device.discard(ctx).unwrap();
        device.destroy_buffer(buffer);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_upload_buffer_lands_in_destination() {
        let mut device = device();
        let buffer = device.create_buffer(&BufferDescriptor::structured(4, 4)).unwrap();
        let readback = device.create_buffer(&BufferDescriptor::readback(16)).unwrap();

        let mut ctx = device.context(QueueType::Direct).unwrap();
        let data: [u32; 4] = [1, 2, 3, 4];
        ctx.upload_buffer(&mut device, buffer, 0, bytemuck::cast_slice(&data)).unwrap();
        ctx.copy_buffer(&device, buffer, 0, readback, 0, 16).unwrap();
        device.execute(ctx).unwrap().wait(None).unwrap();

        let bytes = device.read_buffer(readback, 0, 16).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&bytes), &data);

        device.destroy_buffer(buffer);
        device.destroy_buffer(readback);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_upload_texture_checks_size() {
        let mut device = device();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                8,
                8,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            ))
            .unwrap();

        let mut ctx = device.context(QueueType::Direct).unwrap();
        assert!(ctx.upload_texture(&mut device, texture, 0, 0, &[0u8; 16]).is_err());
        ctx.upload_texture(&mut device, texture, 0, 0, &[0u8; 8 * 8 * 4]).unwrap();
        assert_eq!(
            ctx.tracker().current_state(
                device.resources().texture(texture).unwrap().resource_key(),
                Subresource::Index(0)
            ),
            Some(ResourceState::COPY_DEST)
        );
        device.execute(ctx).unwrap();

        let copied = device
            .backend()
            .submitted_commands()
            .iter()
            .any(|c| matches!(c, NullCommand::CopyBufferToTexture { row_pitch: 256, .. }));
        assert!(copied);

        device.destroy_texture(texture);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_dispatch_binds_temporary_table() {
        let mut device = device();
        let shader = device.create_shader(&ShaderDescriptor::compute(vec![0; 16])).unwrap();
        let layout = BindingLayout::new().shader_resources(1).unordered_access(1);
        let pipeline = device.create_compute_pipeline(shader, layout).unwrap();
        let input = device.create_buffer(&BufferDescriptor::structured(16, 4)).unwrap();
        let output = device.create_buffer(&BufferDescriptor::structured(16, 4)).unwrap();

        let mut ctx = device.context(QueueType::Compute).unwrap();
        ctx.set_compute_pipeline(&device, pipeline).unwrap();
        assert!(ctx.dispatch(&device, 1, 1, 1).is_err());

        let group = BindGroup::new(vec![
            BindGroupEntry::BufferRead(input),
            BindGroupEntry::BufferReadWrite(output),
        ]);
        ctx.bind_compute_resources(&mut device, &group).unwrap();
        ctx.dispatch(&device, 4, 1, 1).unwrap();
        assert_eq!(ctx.dispatch_count(), 1);

        let before = device.descriptor_stats()[DescriptorHeapType::CbvSrvUav.index()].temporary_used;
        assert_eq!(before, 2);
        device.execute(ctx).unwrap();

        let dispatched = device
            .backend()
            .submitted_commands()
            .iter()
            .any(|c| matches!(c, NullCommand::Dispatch { x: 4, y: 1, z: 1 }));
        assert!(dispatched);

        device.destroy_pipeline(pipeline);
        device.destroy_shader(shader);
        device.destroy_buffer(input);
        device.destroy_buffer(output);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_bind_group_mismatch() {
        let mut device = device();
        let shader = device.create_shader(&ShaderDescriptor::compute(vec![0; 16])).unwrap();
        let pipeline = device
            .create_compute_pipeline(shader, BindingLayout::new().unordered_access(1))
            .unwrap();
        let buffer = device.create_buffer(&BufferDescriptor::structured(16, 4)).unwrap();

        let mut ctx = device.context(QueueType::Direct).unwrap();
        ctx.set_compute_pipeline(&device, pipeline).unwrap();
        let group = BindGroup::new(vec![BindGroupEntry::BufferRead(buffer)]);
        assert!(ctx.bind_compute_resources(&mut device, &group).is_err());
        device.discard(ctx).unwrap();

        device.destroy_pipeline(pipeline);
        device.destroy_shader(shader);
        device.destroy_buffer(buffer);
        device.shutdown().unwrap();
    }

    #[test]
    fn test_copy_queue_rejects_compute() {
        let mut device = device();
        let shader = device.create_shader(&ShaderDescriptor::compute(vec![0; 16])).unwrap();
        let pipeline = device.create_compute_pipeline(shader, BindingLayout::new()).unwrap();

        let mut ctx = device.context(QueueType::Copy).unwrap();
        assert!(ctx.set_compute_pipeline(&device, pipeline).is_err());
        device.discard(ctx).unwrap();

        device.destroy_pipeline(pipeline);
        device.destroy_shader(shader);
        device.shutdown().unwrap();
    }
}
