//! 软件空后端
//!
//! 不访问 GPU：缓冲区是主机内存，拷贝在提交时立即执行，栅栏在信号时立即完成。
//! 录制的命令会追加到提交日志，测试可以检查。
//!
//! `with_manual_completion` 创建的后端不会自动完成栅栏，需要调用 [`NullBackend::complete_all`]，
//! 用来模拟 GPU 落后于 CPU。

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::core::error::{BackendApi, Result, RhiError};
use crate::renderer::backend_trait::{DescriptorView, RenderBackend, ResolvedBarrier};
use crate::renderer::command::QueueType;
use crate::renderer::descriptor::{DescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapType};
use crate::renderer::resource::{
    BindingLayout, BufferDescriptor, ShaderDescriptor, TextureDescriptor, TextureFootprint,
};
use crate::renderer::sync::{GpuFence, SoftwareFence};

const DESCRIPTOR_INCREMENT: u32 = 32;

/// 提交日志中的一条命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NullCommand {
    Barriers { transitions: usize, uav: usize },
    CopyBuffer { src: u64, dst: u64, size: u64 },
    CopyBufferToTexture { src: u64, dst: u64, mip: u32, layer: u32, row_pitch: u64 },
    BindCompute { pipeline: u64, table: Option<u32> },
    Dispatch { x: u32, y: u32, z: u32 },
}

/// 一块主机内存，地址在对象移动时保持不变
struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len.max(1)].into_boxed_slice();
        let len = boxed.len();
        let raw = Box::into_raw(boxed) as *mut u8;
        Self {
            // SAFETY: Box::into_raw 不会返回空指针
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len,
        }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/len 来自 zeroed 中的 Box::into_raw
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)));
        }
    }
}

pub struct NullBuffer {
    id: u64,
    size: u64,
    host_visible: bool,
    memory: HostMemory,
}

impl NullBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

pub struct NullTexture {
    id: u64,
    subresources: u32,
}

impl NullTexture {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct NullShader {
    id: u64,
}

pub struct NullPipeline {
    id: u64,
    slots: u32,
}

impl NullPipeline {
    pub fn slots(&self) -> u32 {
        self.slots
    }
}

/// 写入描述符槽位的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullView {
    ConstantBuffer(u64),
    BufferSrv(u64),
    BufferUav(u64),
    TextureSrv(u64),
    TextureUav(u64, u32),
    RenderTarget(u64),
    DepthStencil(u64),
    Sampler,
}

pub struct NullDescriptorHeap {
    heap_type: DescriptorHeapType,
    cpu_base: usize,
    gpu_base: u64,
    slots: Vec<Option<NullView>>,
}

impl NullDescriptorHeap {
    pub fn view(&self, index: u32) -> Option<NullView> {
        self.slots.get(index as usize).copied().flatten()
    }
}

pub struct NullQueue {
    queue_type: QueueType,
}

/// 空后端的栅栏
///
/// `signaled` 是队列上已经排队的最大值，`completed` 是“GPU”已完成的值。
pub struct NullFence {
    completed: Arc<SoftwareFence>,
    signaled: Arc<AtomicU64>,
}

impl GpuFence for NullFence {
    fn completed_value(&self) -> u64 {
        self.completed.completed_value()
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()> {
        self.completed.wait(value, timeout)
    }
}

struct HostCopy {
    src: NonNull<u8>,
    dst: NonNull<u8>,
    len: usize,
}

pub struct NullCommandList {
    queue_type: QueueType,
    recording: bool,
    commands: Vec<NullCommand>,
    copies: Vec<HostCopy>,
}

/// 软件空后端
pub struct NullBackend {
    next_id: AtomicU64,
    manual_completion: bool,
    fences: Mutex<Vec<(Arc<SoftwareFence>, Arc<AtomicU64>)>>,
    submitted: Mutex<Vec<NullCommand>>,
}

impl NullBackend {
    /// 栅栏在信号时立即完成
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            manual_completion: false,
            fences: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// 栅栏只在 `complete_all` 时完成
    pub fn with_manual_completion() -> Self {
        Self {
            manual_completion: true,
            ..Self::new()
        }
    }

    /// 让所有栅栏追上已经排队的信号
    pub fn complete_all(&self) {
        for (completed, signaled) in self.fences.lock().iter() {
            completed.signal(signaled.load(Ordering::Acquire));
        }
    }

    /// 到目前为止提交过的所有命令
    pub fn submitted_commands(&self) -> Vec<NullCommand> {
        self.submitted.lock().clone()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn null_error(call: &'static str, message: impl ToString) -> RhiError {
    RhiError::backend(BackendApi::Null, call, message)
}

impl RenderBackend for NullBackend {
    type Buffer = NullBuffer;
    type Texture = NullTexture;
    type Shader = NullShader;
    type Pipeline = NullPipeline;
    type DescriptorHeap = NullDescriptorHeap;
    type Queue = NullQueue;
    type Fence = NullFence;
    type CommandList = NullCommandList;

    fn api(&self) -> BackendApi {
        BackendApi::Null
    }

    fn adapter_name(&self) -> &str {
        "Null Device"
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<NullBuffer> {
        let size = usize::try_from(desc.size).map_err(|_| null_error("create_buffer", "size overflows usize"))?;
        Ok(NullBuffer {
            id: self.next_id(),
            size: desc.size,
            host_visible: desc.memory_type.is_host_visible(),
            memory: HostMemory::zeroed(size),
        })
    }

    fn destroy_buffer(&self, buffer: NullBuffer) {
        trace!(id = buffer.id, "Null buffer destroyed");
    }

    fn map_buffer(&self, buffer: &NullBuffer) -> Result<Option<NonNull<u8>>> {
        Ok(buffer.host_visible.then_some(buffer.memory.ptr))
    }

    fn buffer_gpu_address(&self, buffer: &NullBuffer) -> u64 {
        buffer.id << 32
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<NullTexture> {
        Ok(NullTexture {
            id: self.next_id(),
            subresources: desc.subresource_count(),
        })
    }

    fn destroy_texture(&self, texture: NullTexture) {
        trace!(id = texture.id, subresources = texture.subresources, "Null texture destroyed");
    }

    fn create_shader(&self, _desc: &ShaderDescriptor) -> Result<NullShader> {
        Ok(NullShader { id: self.next_id() })
    }

    fn destroy_shader(&self, _shader: NullShader) {}

    fn create_compute_pipeline(
        &self,
        shader: &NullShader,
        _entry_point: &str,
        layout: &BindingLayout,
        _resource_heap: &NullDescriptorHeap,
        _sampler_heap: &NullDescriptorHeap,
    ) -> Result<NullPipeline> {
        trace!(shader = shader.id, "Null compute pipeline created");
        Ok(NullPipeline {
            id: self.next_id(),
            slots: layout.descriptor_count(),
        })
    }

    fn destroy_pipeline(&self, _pipeline: NullPipeline) {}

    fn descriptor_increment_size(&self, _heap_type: DescriptorHeapType) -> u32 {
        DESCRIPTOR_INCREMENT
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDescriptor) -> Result<NullDescriptorHeap> {
        let base = (desc.heap_type.index() + 1) << 28;
        Ok(NullDescriptorHeap {
            heap_type: desc.heap_type,
            cpu_base: base,
            gpu_base: (base as u64) << 8,
            slots: vec![None; desc.capacity.total() as usize],
        })
    }

    fn descriptor_heap_base(&self, heap: &NullDescriptorHeap) -> (usize, Option<u64>) {
        (heap.cpu_base, Some(heap.gpu_base))
    }

    fn destroy_descriptor_heap(&self, heap: NullDescriptorHeap) {
        debug!(heap = %heap.heap_type, "Null descriptor heap destroyed");
    }

    fn write_descriptor(
        &self,
        heap: &mut NullDescriptorHeap,
        slot: &DescriptorHandle,
        view: DescriptorView<'_, Self>,
    ) -> Result<()> {
        if view.heap_type() != heap.heap_type {
            return Err(null_error(
                "write_descriptor",
                format!("{} view written into {} heap", view.heap_type(), heap.heap_type),
            ));
        }
        let written = match view {
            DescriptorView::ConstantBuffer { buffer, .. } => NullView::ConstantBuffer(buffer.id),
            DescriptorView::BufferSrv { buffer, .. } => NullView::BufferSrv(buffer.id),
            DescriptorView::BufferUav { buffer, .. } => NullView::BufferUav(buffer.id),
            DescriptorView::TextureSrv { texture, .. } => NullView::TextureSrv(texture.id),
            DescriptorView::TextureUav { texture, mip, .. } => NullView::TextureUav(texture.id, mip),
            DescriptorView::RenderTarget { texture, .. } => NullView::RenderTarget(texture.id),
            DescriptorView::DepthStencil { texture, .. } => NullView::DepthStencil(texture.id),
            DescriptorView::Sampler(_) => NullView::Sampler,
        };
        let Some(entry) = heap.slots.get_mut(slot.index as usize) else {
            return Err(null_error(
                "write_descriptor",
                format!("slot {} out of range ({} slots)", slot.index, heap.slots.len()),
            ));
        };
        *entry = Some(written);
        Ok(())
    }

    fn create_queue(&self, queue_type: QueueType) -> Result<NullQueue> {
        Ok(NullQueue { queue_type })
    }

    fn create_fence(&self, initial_value: u64) -> Result<NullFence> {
        let completed = Arc::new(SoftwareFence::new(initial_value));
        let signaled = Arc::new(AtomicU64::new(initial_value));
        self.fences.lock().push((completed.clone(), signaled.clone()));
        Ok(NullFence { completed, signaled })
    }

    fn queue_signal(&self, queue: &NullQueue, fence: &NullFence, value: u64) -> Result<()> {
        fence.signaled.fetch_max(value, Ordering::AcqRel);
        if !self.manual_completion {
            fence.completed.signal(value);
        }
        trace!(queue = %queue.queue_type, value, "Null queue signal");
        Ok(())
    }

    fn queue_wait(&self, queue: &NullQueue, fence: &NullFence, value: u64) -> Result<()> {
        // 空后端按提交顺序立即执行，GPU 侧等待没有可观察的效果
        trace!(
            queue = %queue.queue_type,
            value,
            signaled = fence.signaled.load(Ordering::Acquire),
            "Null queue wait"
        );
        Ok(())
    }

    fn create_command_list(&self, queue_type: QueueType) -> Result<NullCommandList> {
        Ok(NullCommandList {
            queue_type,
            recording: false,
            commands: Vec::new(),
            copies: Vec::new(),
        })
    }

    fn destroy_command_list(&self, _list: NullCommandList) {}

    fn begin_command_list(&self, list: &mut NullCommandList) -> Result<()> {
        if list.recording {
            return Err(null_error("begin_command_list", "command list is already recording"));
        }
        list.commands.clear();
        list.copies.clear();
        list.recording = true;
        Ok(())
    }

    fn end_command_list(&self, list: &mut NullCommandList) -> Result<()> {
        if !list.recording {
            return Err(null_error("end_command_list", "command list is not recording"));
        }
        list.recording = false;
        Ok(())
    }

    fn submit(&self, queue: &NullQueue, list: &NullCommandList) -> Result<()> {
        if list.recording {
            return Err(null_error("submit", "command list is still open"));
        }
        if list.queue_type != queue.queue_type {
            return Err(null_error(
                "submit",
                format!("{} command list submitted to {} queue", list.queue_type, queue.queue_type),
            ));
        }
        for copy in &list.copies {
            // SAFETY: 源和目标都在各自缓冲区的主机内存范围内，录制时已检查
            unsafe { std::ptr::copy(copy.src.as_ptr(), copy.dst.as_ptr(), copy.len) };
        }
        self.submitted.lock().extend(list.commands.iter().cloned());
        Ok(())
    }

    fn cmd_resource_barriers(&self, list: &mut NullCommandList, barriers: &[ResolvedBarrier<'_, Self>]) {
        let uav = barriers
            .iter()
            .filter(|b| matches!(b, ResolvedBarrier::Uav { .. }))
            .count();
        list.commands.push(NullCommand::Barriers {
            transitions: barriers.len() - uav,
            uav,
        });
    }

    fn cmd_copy_buffer(
        &self,
        list: &mut NullCommandList,
        src: &NullBuffer,
        src_offset: u64,
        dst: &NullBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        if src_offset + size <= src.memory.len as u64 && dst_offset + size <= dst.memory.len as u64 {
            // SAFETY: 偏移已检查在主机内存范围内
            let (src_ptr, dst_ptr) = unsafe {
                (
                    src.memory.ptr.as_ptr().add(src_offset as usize),
                    dst.memory.ptr.as_ptr().add(dst_offset as usize),
                )
            };
            if let (Some(src), Some(dst)) = (NonNull::new(src_ptr), NonNull::new(dst_ptr)) {
                list.copies.push(HostCopy {
                    src,
                    dst,
                    len: size as usize,
                });
            }
        }
        list.commands.push(NullCommand::CopyBuffer {
            src: src.id,
            dst: dst.id,
            size,
        });
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: &mut NullCommandList,
        src: &NullBuffer,
        footprint: &TextureFootprint,
        dst: &NullTexture,
        _dst_desc: &TextureDescriptor,
    ) {
        list.commands.push(NullCommand::CopyBufferToTexture {
            src: src.id,
            dst: dst.id,
            mip: footprint.mip_level,
            layer: footprint.array_layer,
            row_pitch: footprint.row_pitch,
        });
    }

    fn cmd_bind_compute(
        &self,
        list: &mut NullCommandList,
        pipeline: &NullPipeline,
        _resource_heap: &NullDescriptorHeap,
        _sampler_heap: &NullDescriptorHeap,
        table: Option<&DescriptorHandle>,
    ) {
        list.commands.push(NullCommand::BindCompute {
            pipeline: pipeline.id,
            table: table.map(|t| t.index),
        });
    }

    fn cmd_dispatch(&self, list: &mut NullCommandList, x: u32, y: u32, z: u32) {
        list.commands.push(NullCommand::Dispatch { x, y, z });
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resource::{BufferUsage, MemoryType};

    #[test]
    fn test_manual_completion() {
        let backend = NullBackend::with_manual_completion();
        let queue = backend.create_queue(QueueType::Direct).unwrap();
        let fence = backend.create_fence(0).unwrap();

        backend.queue_signal(&queue, &fence, 3).unwrap();
        assert_eq!(fence.completed_value(), 0);
        assert!(fence.wait(3, Some(Duration::from_millis(1))).unwrap_err().is_device_lost());

        backend.complete_all();
        assert_eq!(fence.completed_value(), 3);
    }

    #[test]
    fn test_copy_executes_on_submit() {
        let backend = NullBackend::new();
        let desc = BufferDescriptor::new(8, BufferUsage::COPY_SRC | BufferUsage::COPY_DST, MemoryType::Upload);
        let src = backend.create_buffer(&desc).unwrap();
        let dst = backend.create_buffer(&desc).unwrap();
        let ptr = backend.map_buffer(&src).unwrap().unwrap();
        // SAFETY: 上传缓冲区有 8 字节主机内存
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr(), 4) };

        let queue = backend.create_queue(QueueType::Copy).unwrap();
        let mut list = backend.create_command_list(QueueType::Copy).unwrap();
        backend.begin_command_list(&mut list).unwrap();
        backend.cmd_copy_buffer(&mut list, &src, 0, &dst, 4, 4);
        assert!(backend.submit(&queue, &list).is_err());
        backend.end_command_list(&mut list).unwrap();
        backend.submit(&queue, &list).unwrap();

        let dst_ptr = backend.map_buffer(&dst).unwrap().unwrap();
        // SAFETY: 目标缓冲区有 8 字节主机内存
        let bytes = unsafe { std::slice::from_raw_parts(dst_ptr.as_ptr(), 8) };
        assert_eq!(bytes, &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_descriptor_heap_type_checked() {
        let backend = NullBackend::new();
        let desc = DescriptorHeapDescriptor::rtv(crate::core::config::HeapCapacity::new(4, 0));
        let mut heap = backend.create_descriptor_heap(&desc).unwrap();
        let slot = DescriptorHandle {
            cpu: crate::renderer::descriptor::CpuDescriptorHandle::new(heap.cpu_base, 0),
            gpu: None,
            index: 0,
            count: 1,
            heap_type: DescriptorHeapType::Rtv,
            region: crate::renderer::descriptor::DescriptorRegion::Persistent,
        };
        let sampler = crate::renderer::resource::SamplerDescriptor::default();
        assert!(backend
            .write_descriptor(&mut heap, &slot, DescriptorView::Sampler(&sampler))
            .is_err());
        assert_eq!(heap.view(0), None);
    }
}
