//! 资源管理模块
//!
//! 缓冲区、纹理、着色器和计算管线都存放在 [`Pool`] 中，对外只暴露句柄。
//! 每个资源独占它的后端对象；资源创建时为默认视图申请持久描述符，
//! 销毁时经过延迟删除队列，到期后才释放后端对象和描述符。
//!
//! # 设计原则
//!
//! - **句柄访问**：调用方只持有 `Handle<Buffer<B>>` 等句柄，过期句柄查不到对象
//! - **自动对齐**：常量缓冲区大小对齐到 256 字节
//! - **显式布局**：计算管线的绑定布局由调用方声明，不依赖着色器反射

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::core::config::PoolConfig;
use crate::core::error::{Result, RhiError};

use super::backend_trait::RenderBackend;
use super::descriptor::{DescriptorHandle, DescriptorType};
use super::handle::{Handle, Pool};
use super::ring_buffer::MappedMemory;
use super::state::{ResourceKey, ResourceState, TrackedResource};

/// 常量缓冲区对齐
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// 纹理上传时每行的对齐（D3D12_TEXTURE_DATA_PITCH_ALIGNMENT）
pub const TEXTURE_ROW_PITCH_ALIGNMENT: u64 = 256;

/// 纹理上传数据起始偏移的对齐（D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT）
pub const TEXTURE_PLACEMENT_ALIGNMENT: u64 = 512;

pub type BufferHandle<B> = Handle<Buffer<B>>;
pub type TextureHandle<B> = Handle<Texture<B>>;
pub type ShaderHandle<B> = Handle<Shader<B>>;
pub type PipelineHandle<B> = Handle<Pipeline<B>>;

bitflags! {
    /// 缓冲区用途
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// 常量缓冲区（生成 CBV）
        const UNIFORM = 1 << 0;
        /// 存储缓冲区（生成 SRV + UAV）
        const STORAGE = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
    }
}

bitflags! {
    /// 纹理用途
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// 着色器采样（生成 SRV）
        const SAMPLED = 1 << 0;
        /// 着色器读写（生成 UAV）
        const STORAGE = 1 << 1;
        /// 渲染目标（生成 RTV）
        const RENDER_TARGET = 1 << 2;
        /// 深度模板（生成 DSV）
        const DEPTH_STENCIL = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

/// 缓冲区内存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// GPU本地内存（最快，仅GPU可访问）
    DeviceLocal,
    /// 上传堆（CPU 写，GPU 读）
    Upload,
    /// 读回堆（GPU 写，CPU 读）
    Readback,
}

impl MemoryType {
    /// CPU 是否可以映射
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryType::DeviceLocal)
    }
}

/// 缓冲区描述信息
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    /// 缓冲区大小（字节）
    pub size: u64,
    pub usage: BufferUsage,
    /// 内存类型
    pub memory_type: MemoryType,
    /// 结构化缓冲区的元素跨度，0 表示原始（字节地址）缓冲区
    pub stride: u32,
    /// 调试名称（可选）
    pub name: Option<String>,
}

impl BufferDescriptor {
    /// 创建新的缓冲区描述符
    pub fn new(size: u64, usage: BufferUsage, memory_type: MemoryType) -> Self {
        Self {
            size,
            usage,
            memory_type,
            stride: 0,
            name: None,
        }
    }

    /// GPU 本地的常量缓冲区
    pub fn uniform(size: u64) -> Self {
        Self::new(size, BufferUsage::UNIFORM | BufferUsage::COPY_DST, MemoryType::DeviceLocal)
    }

    /// GPU 本地的结构化存储缓冲区
    pub fn structured(element_count: u64, stride: u32) -> Self {
        Self::new(
            element_count * u64::from(stride),
            BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            MemoryType::DeviceLocal,
        )
        .with_stride(stride)
    }

    /// 读回缓冲区
    pub fn readback(size: u64) -> Self {
        Self::new(size, BufferUsage::COPY_DST, MemoryType::Readback)
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// 设置调试名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 计算对齐后的大小（DirectX 12 常量缓冲区要求256字节对齐）
    pub fn aligned_size(&self) -> u64 {
        if self.usage.contains(BufferUsage::UNIFORM) {
            (self.size + CONSTANT_BUFFER_ALIGNMENT - 1) & !(CONSTANT_BUFFER_ALIGNMENT - 1)
        } else {
            self.size
        }
    }

    /// 首次使用时的状态（上传堆和读回堆的状态固定）
    pub fn fixed_state(&self) -> Option<ResourceState> {
        match self.memory_type {
            MemoryType::DeviceLocal => None,
            MemoryType::Upload => Some(ResourceState::GENERIC_READ),
            MemoryType::Readback => Some(ResourceState::COPY_DEST),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(RhiError::ContractViolation("buffer size must be greater than 0".into()));
        }
        if self.stride != 0 && self.size % u64::from(self.stride) != 0 {
            return Err(RhiError::ContractViolation(format!(
                "buffer size {} is not a multiple of its stride {}",
                self.size, self.stride
            )));
        }
        if self.memory_type == MemoryType::Readback && self.usage.intersects(BufferUsage::STORAGE) {
            return Err(RhiError::ContractViolation("readback buffers cannot be storage buffers".into()));
        }
        Ok(())
    }
}

/// 纹理格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// RGBA 8位无符号整数
    Rgba8Unorm,
    /// RGBA 8位sRGB
    Rgba8Srgb,
    /// BGRA 8位无符号整数
    Bgra8Unorm,
    /// RGBA 16位浮点
    Rgba16Float,
    /// R 32位浮点
    R32Float,
    /// R 32位无符号整数
    R32Uint,
    /// RGBA 32位浮点
    Rgba32Float,
    /// 深度 24位 + 模板 8位
    Depth24PlusStencil8,
    /// 深度 32位浮点
    Depth32Float,
}

impl TextureFormat {
    /// 每个像素的字节数
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8Srgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8 | TextureFormat::Depth32Float)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    /// 是否支持无序访问
    pub fn supports_storage(self) -> bool {
        !self.is_depth() && !matches!(self, TextureFormat::Rgba8Srgb | TextureFormat::Bgra8Unorm)
    }
}

/// 纹理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureType {
    /// 1D纹理
    Texture1D,
    /// 2D纹理
    Texture2D,
    /// 3D纹理
    Texture3D,
    /// 立方体贴图
    TextureCube,
}

/// 纹理描述信息
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    /// 宽度
    pub width: u32,
    /// 高度
    pub height: u32,
    /// 深度（3D纹理）或数组层数
    pub depth_or_array_layers: u32,
    /// Mip等级数量
    pub mip_levels: u32,
    /// 纹理格式
    pub format: TextureFormat,
    /// 纹理类型
    pub texture_type: TextureType,
    pub usage: TextureUsage,
    /// 调试名称
    pub name: Option<String>,
}

impl TextureDescriptor {
    /// 单层 2D 纹理
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            depth_or_array_layers: 1,
            mip_levels: 1,
            format,
            texture_type: TextureType::Texture2D,
            usage,
            name: None,
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.depth_or_array_layers = layers;
        self
    }

    /// 设置调试名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 数组层数（3D 纹理为 1）
    pub fn array_layers(&self) -> u32 {
        match self.texture_type {
            TextureType::Texture3D => 1,
            _ => self.depth_or_array_layers.max(1),
        }
    }

    /// 子资源数量 = mip 数 × 数组层数
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels.max(1) * self.array_layers()
    }

    /// D3D12 的子资源平铺下标
    pub fn subresource_index(&self, mip: u32, layer: u32) -> u32 {
        mip + layer * self.mip_levels.max(1)
    }

    /// 某个 mip 的尺寸
    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        let depth = match self.texture_type {
            TextureType::Texture3D => (self.depth_or_array_layers >> mip).max(1),
            _ => 1,
        };
        ((self.width >> mip).max(1), (self.height >> mip).max(1), depth)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth_or_array_layers == 0 {
            return Err(RhiError::ContractViolation("texture dimensions must be greater than 0".into()));
        }
        let max_mips = 32 - self.width.max(self.height).leading_zeros();
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return Err(RhiError::ContractViolation(format!(
                "texture with {}x{} supports 1..={} mip levels, got {}",
                self.width, self.height, max_mips, self.mip_levels
            )));
        }
        if self.texture_type == TextureType::TextureCube && self.depth_or_array_layers % 6 != 0 {
            return Err(RhiError::ContractViolation("cube textures need a multiple of 6 layers".into()));
        }
        if self.usage.contains(TextureUsage::DEPTH_STENCIL) != self.format.is_depth() {
            return Err(RhiError::ContractViolation(format!(
                "depth-stencil usage does not match format {:?}",
                self.format
            )));
        }
        if self.usage.contains(TextureUsage::STORAGE) && !self.format.supports_storage() {
            return Err(RhiError::ContractViolation(format!(
                "format {:?} does not support storage usage",
                self.format
            )));
        }
        Ok(())
    }
}

/// 缓冲区到纹理子资源的拷贝布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFootprint {
    /// 数据在源缓冲区中的偏移
    pub buffer_offset: u64,
    /// 每行字节数（已对齐）
    pub row_pitch: u64,
    pub mip_level: u32,
    pub array_layer: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl TextureFootprint {
    /// 计算某个子资源的上传布局（偏移为 0）
    pub fn for_subresource(desc: &TextureDescriptor, mip_level: u32, array_layer: u32) -> Self {
        let (width, height, depth) = desc.mip_extent(mip_level);
        let row_bytes = u64::from(width) * u64::from(desc.format.bytes_per_pixel());
        Self {
            buffer_offset: 0,
            row_pitch: super::ring::align_up(row_bytes, TEXTURE_ROW_PITCH_ALIGNMENT),
            mip_level,
            array_layer,
            width,
            height,
            depth,
        }
    }

    /// 紧密排列时每行字节数
    pub fn row_bytes(&self, format: TextureFormat) -> u64 {
        u64::from(self.width) * u64::from(format.bytes_per_pixel())
    }

    /// 对齐后的总字节数
    pub fn total_size(&self) -> u64 {
        self.row_pitch * u64::from(self.height) * u64::from(self.depth)
    }
}

/// 着色器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
}

/// 着色器描述（预编译字节码：Vulkan 为 SPIR-V，D3D12 为 DXIL / DXBC）
#[derive(Debug, Clone)]
pub struct ShaderDescriptor {
    pub stage: ShaderStage,
    pub bytecode: Vec<u8>,
    pub entry_point: String,
    pub name: Option<String>,
}

impl ShaderDescriptor {
    pub fn compute(bytecode: Vec<u8>) -> Self {
        Self {
            stage: ShaderStage::Compute,
            bytecode,
            entry_point: "main".to_string(),
            name: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// 绑定槽位类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
}

impl BindingKind {
    pub fn descriptor_type(self) -> DescriptorType {
        match self {
            BindingKind::ConstantBuffer => DescriptorType::ConstantBufferView,
            BindingKind::ShaderResource => DescriptorType::ShaderResourceView,
            BindingKind::UnorderedAccess => DescriptorType::UnorderedAccessView,
        }
    }

    /// 计算着色器访问时资源需要的状态
    pub fn compute_state(self) -> ResourceState {
        match self {
            BindingKind::ConstantBuffer => ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            BindingKind::ShaderResource => ResourceState::NON_PIXEL_SHADER_RESOURCE,
            BindingKind::UnorderedAccess => ResourceState::UNORDERED_ACCESS,
        }
    }
}

/// 绑定布局中的一组连续槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlot {
    pub kind: BindingKind,
    pub count: u32,
}

/// 显式声明的绑定布局
///
/// 槽位按声明顺序排列成一张描述符表；同类槽位的寄存器编号（b#/t#/u#）按出现顺序递增。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingLayout {
    slots: Vec<BindingSlot>,
}

impl BindingLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant_buffers(self, count: u32) -> Self {
        self.push(BindingKind::ConstantBuffer, count)
    }

    pub fn shader_resources(self, count: u32) -> Self {
        self.push(BindingKind::ShaderResource, count)
    }

    pub fn unordered_access(self, count: u32) -> Self {
        self.push(BindingKind::UnorderedAccess, count)
    }

    fn push(mut self, kind: BindingKind, count: u32) -> Self {
        if count > 0 {
            self.slots.push(BindingSlot { kind, count });
        }
        self
    }

    pub fn slots(&self) -> &[BindingSlot] {
        &self.slots
    }

    /// 描述符表的总槽位数
    pub fn descriptor_count(&self) -> u32 {
        self.slots.iter().map(|s| s.count).sum()
    }

    /// 展开成逐个槽位的类型
    pub fn flatten(&self) -> impl Iterator<Item = BindingKind> + '_ {
        self.slots
            .iter()
            .flat_map(|s| std::iter::repeat(s.kind).take(s.count as usize))
    }
}

/// 绑定组中的一个条目
pub enum BindGroupEntry<B: RenderBackend> {
    /// 常量缓冲区（整个缓冲区）
    ConstantBuffer(BufferHandle<B>),
    /// 只读缓冲区
    BufferRead(BufferHandle<B>),
    /// 可读写缓冲区
    BufferReadWrite(BufferHandle<B>),
    /// 采样纹理（全部 mip）
    TextureRead(TextureHandle<B>),
    /// 可读写纹理的某个 mip
    TextureReadWrite(TextureHandle<B>, u32),
}

impl<B: RenderBackend> BindGroupEntry<B> {
    pub fn kind(&self) -> BindingKind {
        match self {
            BindGroupEntry::ConstantBuffer(_) => BindingKind::ConstantBuffer,
            BindGroupEntry::BufferRead(_) | BindGroupEntry::TextureRead(_) => BindingKind::ShaderResource,
            BindGroupEntry::BufferReadWrite(_) | BindGroupEntry::TextureReadWrite(..) => BindingKind::UnorderedAccess,
        }
    }
}

/// 一次分派使用的资源，按布局顺序排列
pub struct BindGroup<B: RenderBackend> {
    pub entries: Vec<BindGroupEntry<B>>,
}

impl<B: RenderBackend> BindGroup<B> {
    pub fn new(entries: Vec<BindGroupEntry<B>>) -> Self {
        Self { entries }
    }

    /// 检查条目与布局逐个匹配
    pub fn validate(&self, layout: &BindingLayout) -> Result<()> {
        let expected = layout.descriptor_count() as usize;
        if self.entries.len() != expected {
            return Err(RhiError::CommandRecording(format!(
                "bind group has {} entries, layout declares {}",
                self.entries.len(),
                expected
            )));
        }
        for (i, (entry, kind)) in self.entries.iter().zip(layout.flatten()).enumerate() {
            if entry.kind() != kind {
                return Err(RhiError::CommandRecording(format!(
                    "bind group entry {} is {:?}, layout declares {:?}",
                    i,
                    entry.kind(),
                    kind
                )));
            }
        }
        Ok(())
    }
}

/// 采样过滤方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// 采样寻址方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
}

/// 采样器描述
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescriptor {
    pub filter: FilterMode,
    pub address_mode: AddressMode,
    /// 1 表示关闭各向异性过滤
    pub max_anisotropy: u32,
    pub max_lod: f32,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            filter: FilterMode::Linear,
            address_mode: AddressMode::Repeat,
            max_anisotropy: 1,
            max_lod: f32::MAX,
        }
    }
}

/// 缓冲区的默认视图
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferViews {
    pub cbv: Option<DescriptorHandle>,
    pub srv: Option<DescriptorHandle>,
    pub uav: Option<DescriptorHandle>,
}

impl BufferViews {
    pub fn iter(&self) -> impl Iterator<Item = &DescriptorHandle> {
        [&self.cbv, &self.srv, &self.uav].into_iter().flatten()
    }
}

/// 纹理的默认视图（UAV / RTV / DSV 针对 mip 0）
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureViews {
    pub srv: Option<DescriptorHandle>,
    pub uav: Option<DescriptorHandle>,
    pub rtv: Option<DescriptorHandle>,
    pub dsv: Option<DescriptorHandle>,
}

impl TextureViews {
    pub fn iter(&self) -> impl Iterator<Item = &DescriptorHandle> {
        [&self.srv, &self.uav, &self.rtv, &self.dsv].into_iter().flatten()
    }
}

/// 缓冲区
pub struct Buffer<B: RenderBackend> {
    pub(crate) desc: BufferDescriptor,
    pub(crate) raw: B::Buffer,
    pub(crate) views: BufferViews,
    pub(crate) mapped: Option<MappedMemory>,
    pub(crate) gpu_address: u64,
    pub(crate) key: ResourceKey,
    reset_state: AtomicBool,
}

impl<B: RenderBackend> Buffer<B> {
    pub(crate) fn new(desc: BufferDescriptor, raw: B::Buffer, mapped: Option<MappedMemory>, gpu_address: u64) -> Self {
        Self {
            desc,
            raw,
            views: BufferViews::default(),
            mapped,
            gpu_address,
            key: ResourceKey::Buffer(Handle::<()>::invalid().to_bits()),
            reset_state: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.desc
    }

    pub fn raw(&self) -> &B::Buffer {
        &self.raw
    }

    pub fn views(&self) -> &BufferViews {
        &self.views
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// 着色器中使用的无绑定下标
    pub fn srv_index(&self) -> Option<u32> {
        self.views.srv.map(|d| d.index)
    }

    pub fn uav_index(&self) -> Option<u32> {
        self.views.uav.map(|d| d.index)
    }

    pub fn cbv_index(&self) -> Option<u32> {
        self.views.cbv.map(|d| d.index)
    }

    /// 标记外部状态可能已改变，下一次使用重新提升
    pub fn reset_state(&self) {
        self.reset_state.store(true, Ordering::Relaxed);
    }

    pub(crate) fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped.map(|m| m.as_ptr())
    }
}

impl<B: RenderBackend> TrackedResource for Buffer<B> {
    fn resource_key(&self) -> ResourceKey {
        self.key
    }

    fn subresource_count(&self) -> u32 {
        1
    }

    fn take_reset_state(&self) -> bool {
        self.reset_state.swap(false, Ordering::Relaxed)
    }
}

/// 纹理
pub struct Texture<B: RenderBackend> {
    pub(crate) desc: TextureDescriptor,
    pub(crate) raw: B::Texture,
    pub(crate) views: TextureViews,
    pub(crate) key: ResourceKey,
    reset_state: AtomicBool,
}

impl<B: RenderBackend> Texture<B> {
    pub(crate) fn new(desc: TextureDescriptor, raw: B::Texture) -> Self {
        Self {
            desc,
            raw,
            views: TextureViews::default(),
            key: ResourceKey::Texture(Handle::<()>::invalid().to_bits()),
            reset_state: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.desc
    }

    pub fn raw(&self) -> &B::Texture {
        &self.raw
    }

    pub fn views(&self) -> &TextureViews {
        &self.views
    }

    pub fn srv_index(&self) -> Option<u32> {
        self.views.srv.map(|d| d.index)
    }

    pub fn uav_index(&self) -> Option<u32> {
        self.views.uav.map(|d| d.index)
    }

    /// 标记外部状态可能已改变（例如呈现之后），下一次使用重新提升
    pub fn reset_state(&self) {
        self.reset_state.store(true, Ordering::Relaxed);
    }
}

impl<B: RenderBackend> TrackedResource for Texture<B> {
    fn resource_key(&self) -> ResourceKey {
        self.key
    }

    fn subresource_count(&self) -> u32 {
        self.desc.subresource_count()
    }

    fn take_reset_state(&self) -> bool {
        self.reset_state.swap(false, Ordering::Relaxed)
    }
}

/// 着色器
pub struct Shader<B: RenderBackend> {
    pub(crate) stage: ShaderStage,
    pub(crate) entry_point: String,
    pub(crate) raw: B::Shader,
}

impl<B: RenderBackend> Shader<B> {
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

/// 计算管线
pub struct Pipeline<B: RenderBackend> {
    pub(crate) layout: BindingLayout,
    pub(crate) shader: ShaderHandle<B>,
    pub(crate) raw: B::Pipeline,
}

impl<B: RenderBackend> Pipeline<B> {
    pub fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    pub fn shader(&self) -> ShaderHandle<B> {
        self.shader
    }
}

/// 资源池集合
pub struct ResourcePools<B: RenderBackend> {
    pub buffers: Pool<Buffer<B>>,
    pub textures: Pool<Texture<B>>,
    pub shaders: Pool<Shader<B>>,
    pub pipelines: Pool<Pipeline<B>>,
}

/// 各池的存活对象数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveCounts {
    pub buffers: usize,
    pub textures: usize,
    pub shaders: usize,
    pub pipelines: usize,
}

impl LiveCounts {
    pub fn total(&self) -> usize {
        self.buffers + self.textures + self.shaders + self.pipelines
    }
}

impl<B: RenderBackend> ResourcePools<B> {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            buffers: Pool::new("buffers", config.buffers),
            textures: Pool::new("textures", config.textures),
            shaders: Pool::new("shaders", config.shaders),
            pipelines: Pool::new("pipelines", config.pipelines),
        }
    }

    pub fn live_counts(&self) -> LiveCounts {
        LiveCounts {
            buffers: self.buffers.len(),
            textures: self.textures.len(),
            shaders: self.shaders.len(),
            pipelines: self.pipelines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live_counts().total() == 0
    }

    pub fn buffer(&self, handle: BufferHandle<B>) -> Result<&Buffer<B>> {
        self.buffers.get(handle).ok_or_else(|| invalid_handle("buffer", handle))
    }

    pub fn texture(&self, handle: TextureHandle<B>) -> Result<&Texture<B>> {
        self.textures.get(handle).ok_or_else(|| invalid_handle("texture", handle))
    }

    pub fn shader(&self, handle: ShaderHandle<B>) -> Result<&Shader<B>> {
        self.shaders.get(handle).ok_or_else(|| invalid_handle("shader", handle))
    }

    pub fn pipeline(&self, handle: PipelineHandle<B>) -> Result<&Pipeline<B>> {
        self.pipelines.get(handle).ok_or_else(|| invalid_handle("pipeline", handle))
    }

    /// 按跟踪键找回缓冲区
    pub(crate) fn buffer_by_key(&self, bits: u32) -> Option<&Buffer<B>> {
        self.buffers.get(Handle::from_bits(bits))
    }

    pub(crate) fn texture_by_key(&self, bits: u32) -> Option<&Texture<B>> {
        self.textures.get(Handle::from_bits(bits))
    }
}

fn invalid_handle<T>(kind: &'static str, handle: Handle<T>) -> RhiError {
    RhiError::InvalidHandle {
        kind,
        handle: handle.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_size() {
        let cb = BufferDescriptor::uniform(100);
        assert_eq!(cb.aligned_size(), 256);

        let sb = BufferDescriptor::structured(10, 12);
        assert_eq!(sb.aligned_size(), 120);
    }

    #[test]
    fn test_buffer_validation() {
        assert!(BufferDescriptor::uniform(0).validate().is_err());
        assert!(BufferDescriptor::structured(4, 16).validate().is_ok());
        let bad_stride = BufferDescriptor::new(10, BufferUsage::STORAGE, MemoryType::DeviceLocal).with_stride(4);
        assert!(bad_stride.validate().is_err());
    }

    #[test]
    fn test_subresources() {
        let desc = TextureDescriptor::new_2d(256, 256, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED)
            .with_mip_levels(4)
            .with_array_layers(2);
        assert_eq!(desc.subresource_count(), 8);
        assert_eq!(desc.subresource_index(1, 1), 5);
        assert_eq!(desc.mip_extent(3), (32, 32, 1));
    }

    #[test]
    fn test_texture_validation() {
        let ok = TextureDescriptor::new_2d(64, 64, TextureFormat::Depth32Float, TextureUsage::DEPTH_STENCIL);
        assert!(ok.validate().is_ok());

        let mismatched = TextureDescriptor::new_2d(64, 64, TextureFormat::Rgba8Unorm, TextureUsage::DEPTH_STENCIL);
        assert!(mismatched.validate().is_err());

        let too_many_mips = TextureDescriptor::new_2d(4, 4, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED)
            .with_mip_levels(4);
        assert!(too_many_mips.validate().is_err());

        let srgb_storage = TextureDescriptor::new_2d(4, 4, TextureFormat::Rgba8Srgb, TextureUsage::STORAGE);
        assert!(srgb_storage.validate().is_err());
    }

    #[test]
    fn test_footprint_row_pitch() {
        let desc = TextureDescriptor::new_2d(100, 10, TextureFormat::Rgba8Unorm, TextureUsage::COPY_DST);
        let footprint = TextureFootprint::for_subresource(&desc, 0, 0);
        assert_eq!(footprint.row_bytes(desc.format), 400);
        assert_eq!(footprint.row_pitch, 512);
        assert_eq!(footprint.total_size(), 5120);
    }

    #[test]
    fn test_binding_layout() {
        let layout = BindingLayout::new()
            .constant_buffers(1)
            .shader_resources(2)
            .unordered_access(0)
            .unordered_access(1);
        assert_eq!(layout.slots().len(), 3);
        assert_eq!(layout.descriptor_count(), 4);
        let kinds: Vec<_> = layout.flatten().collect();
        assert_eq!(
            kinds,
            vec![
                BindingKind::ConstantBuffer,
                BindingKind::ShaderResource,
                BindingKind::ShaderResource,
                BindingKind::UnorderedAccess
            ]
        );
    }
}
