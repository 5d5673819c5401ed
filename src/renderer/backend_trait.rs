//! 统一的渲染后端接口
//!
//! 本模块定义了所有图形后端（Null、Vulkan、DX12）都必须实现的底层接口。
//! 上层的池、描述符分配、状态跟踪和延迟删除都只依赖这个 trait，
//! 后端只负责把已经决定好的操作翻译成原生 API 调用。
//!
//! # 设计理念
//!
//! - **静态分发**：后端对象通过关联类型暴露，设备以 `Device<B>` 泛型持有后端
//! - **无状态记录**：屏障、拷贝、分派都作用在调用方传入的命令列表上
//! - **所有权清晰**：`destroy_*` 消耗后端对象，调用方保证 GPU 已不再使用

use std::ptr::NonNull;

use crate::core::error::{BackendApi, Result};

use super::command::QueueType;
use super::descriptor::{DescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapType};
use super::resource::{
    BindingLayout, BufferDescriptor, SamplerDescriptor, ShaderDescriptor, TextureDescriptor, TextureFootprint,
};
use super::state::{ResourceState, Subresource};
use super::sync::GpuFence;

/// 写入描述符槽位的视图
pub enum DescriptorView<'a, B: RenderBackend + ?Sized> {
    /// 常量缓冲区视图
    ConstantBuffer { buffer: &'a B::Buffer, offset: u64, size: u64 },
    /// 只读缓冲区视图，`stride` 为 0 时是原始缓冲区
    BufferSrv {
        buffer: &'a B::Buffer,
        offset: u64,
        size: u64,
        stride: u32,
    },
    /// 可读写缓冲区视图
    BufferUav {
        buffer: &'a B::Buffer,
        offset: u64,
        size: u64,
        stride: u32,
    },
    /// 纹理只读视图（全部 mip 和数组层）
    TextureSrv { texture: &'a B::Texture, desc: &'a TextureDescriptor },
    /// 纹理某个 mip 的可读写视图
    TextureUav {
        texture: &'a B::Texture,
        desc: &'a TextureDescriptor,
        mip: u32,
    },
    RenderTarget {
        texture: &'a B::Texture,
        desc: &'a TextureDescriptor,
        mip: u32,
    },
    DepthStencil {
        texture: &'a B::Texture,
        desc: &'a TextureDescriptor,
        mip: u32,
    },
    Sampler(&'a SamplerDescriptor),
}

impl<'a, B: RenderBackend + ?Sized> DescriptorView<'a, B> {
    /// 视图应写入的堆类型
    pub fn heap_type(&self) -> DescriptorHeapType {
        match self {
            DescriptorView::RenderTarget { .. } => DescriptorHeapType::Rtv,
            DescriptorView::DepthStencil { .. } => DescriptorHeapType::Dsv,
            DescriptorView::Sampler(_) => DescriptorHeapType::Sampler,
            _ => DescriptorHeapType::CbvSrvUav,
        }
    }
}

/// 屏障中引用的原生资源
pub enum RawResource<'a, B: RenderBackend + ?Sized> {
    Buffer(&'a B::Buffer, &'a BufferDescriptor),
    Texture(&'a B::Texture, &'a TextureDescriptor),
}

/// 已解析成原生资源的屏障
pub enum ResolvedBarrier<'a, B: RenderBackend + ?Sized> {
    Transition {
        resource: RawResource<'a, B>,
        subresource: Subresource,
        before: ResourceState,
        after: ResourceState,
    },
    /// `None` 表示所有 UAV 访问
    Uav { resource: Option<RawResource<'a, B>> },
}

/// 统一的渲染后端接口
///
/// # 方法说明
///
/// - 资源：`create_*` / `destroy_*`，缓冲区可以持久映射
/// - 描述符：后端创建原生堆并负责把视图写入指定槽位，槽位分配由上层完成
/// - 队列：提交、信号与等待都以单调递增的栅栏值表示
/// - 录制：屏障、拷贝、计算绑定与分派
///
/// # 示例
///
/// ```ignore
/// let backend = NullBackend::new();
/// let device = Device::new(backend, &config)?;
/// ```
pub trait RenderBackend: Sized + 'static {
    type Buffer;
    type Texture;
    type Shader;
    type Pipeline;
    type DescriptorHeap;
    type Queue;
    type Fence: GpuFence;
    type CommandList;

    fn api(&self) -> BackendApi;

    /// 适配器名称
    fn adapter_name(&self) -> &str;

    // ---- 资源 ----

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Self::Buffer>;

    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// 持久映射 CPU 可见的缓冲区，GPU 本地缓冲区返回 `None`
    fn map_buffer(&self, buffer: &Self::Buffer) -> Result<Option<NonNull<u8>>>;

    /// 缓冲区的 GPU 虚拟地址（Vulkan 没有地址概念时返回 0）
    fn buffer_gpu_address(&self, buffer: &Self::Buffer) -> u64;

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<Self::Texture>;

    fn destroy_texture(&self, texture: Self::Texture);

    fn create_shader(&self, desc: &ShaderDescriptor) -> Result<Self::Shader>;

    fn destroy_shader(&self, shader: Self::Shader);

    /// 创建计算管线，资源与采样器堆决定了无绑定集合的布局
    fn create_compute_pipeline(
        &self,
        shader: &Self::Shader,
        entry_point: &str,
        layout: &BindingLayout,
        resource_heap: &Self::DescriptorHeap,
        sampler_heap: &Self::DescriptorHeap,
    ) -> Result<Self::Pipeline>;

    fn destroy_pipeline(&self, pipeline: Self::Pipeline);

    // ---- 描述符 ----

    /// 相邻槽位之间的地址步长
    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32;

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDescriptor) -> Result<Self::DescriptorHeap>;

    /// 堆起始的 CPU 地址和 GPU 地址（不可被着色器访问的堆没有 GPU 地址）
    fn descriptor_heap_base(&self, heap: &Self::DescriptorHeap) -> (usize, Option<u64>);

    fn destroy_descriptor_heap(&self, heap: Self::DescriptorHeap);

    /// 把视图写入槽位
    fn write_descriptor(
        &self,
        heap: &mut Self::DescriptorHeap,
        slot: &DescriptorHandle,
        view: DescriptorView<'_, Self>,
    ) -> Result<()>;

    // ---- 队列与同步 ----

    fn create_queue(&self, queue_type: QueueType) -> Result<Self::Queue>;

    fn create_fence(&self, initial_value: u64) -> Result<Self::Fence>;

    /// 队列执行到此处时把栅栏设置为 `value`
    fn queue_signal(&self, queue: &Self::Queue, fence: &Self::Fence, value: u64) -> Result<()>;

    /// 队列在 GPU 上等待栅栏达到 `value`
    fn queue_wait(&self, queue: &Self::Queue, fence: &Self::Fence, value: u64) -> Result<()>;

    // ---- 命令列表 ----

    fn create_command_list(&self, queue_type: QueueType) -> Result<Self::CommandList>;

    fn destroy_command_list(&self, list: Self::CommandList);

    /// 重置并开始录制，调用方保证上一次提交已完成
    fn begin_command_list(&self, list: &mut Self::CommandList) -> Result<()>;

    fn end_command_list(&self, list: &mut Self::CommandList) -> Result<()>;

    fn submit(&self, queue: &Self::Queue, list: &Self::CommandList) -> Result<()>;

    // ---- 录制 ----

    fn cmd_resource_barriers(&self, list: &mut Self::CommandList, barriers: &[ResolvedBarrier<'_, Self>]);

    fn cmd_copy_buffer(
        &self,
        list: &mut Self::CommandList,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    );

    /// 从缓冲区拷贝到纹理的一个子资源
    fn cmd_copy_buffer_to_texture(
        &self,
        list: &mut Self::CommandList,
        src: &Self::Buffer,
        footprint: &TextureFootprint,
        dst: &Self::Texture,
        dst_desc: &TextureDescriptor,
    );

    /// 绑定计算管线、描述符堆和本次分派的描述符表
    fn cmd_bind_compute(
        &self,
        list: &mut Self::CommandList,
        pipeline: &Self::Pipeline,
        resource_heap: &Self::DescriptorHeap,
        sampler_heap: &Self::DescriptorHeap,
        table: Option<&DescriptorHandle>,
    );

    fn cmd_dispatch(&self, list: &mut Self::CommandList, x: u32, y: u32, z: u32);

    /// 等待设备上所有工作完成
    fn wait_idle(&self) -> Result<()>;
}
