//! Vulkan 后端实现
//!
//! 把 [`RenderBackend`] 的操作翻译成 ash 调用。几个与 D3D12 模型对齐的约定：
//!
//! - 栅栏是时间线信号量，`FenceValue` 直接作为信号量的计数值
//! - 图像创建后立即转换到 `GENERAL` 布局并一直保持，状态屏障只决定同步范围
//! - 计算管线的推送常量保存本次分派的描述符表起始下标
//! - 资源使用并发共享模式，跨队列使用时不需要所有权转移

use std::ffi::CString;
use std::io::Cursor;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::context::{vk_error, VulkanContext};
use super::conv;
use super::descriptor::{
    create_sampler, VulkanDescriptorHeap, SAMPLED_IMAGE_BINDING, SAMPLER_BINDING, STORAGE_BUFFER_BINDING,
    STORAGE_IMAGE_BINDING,
};
use crate::core::error::{BackendApi, Result, RhiError};
use crate::renderer::backend_trait::{DescriptorView, RawResource, RenderBackend, ResolvedBarrier};
use crate::renderer::command::QueueType;
use crate::renderer::descriptor::{DescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapType};
use crate::renderer::resource::{
    BindingLayout, BufferDescriptor, MemoryType, ShaderDescriptor, TextureDescriptor, TextureFootprint,
    TextureType, TextureUsage,
};
use crate::renderer::state::Subresource;
use crate::renderer::sync::{device_lost, GpuFence};

pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    mapped: Option<NonNull<u8>>,
}

pub struct VulkanTexture {
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    array_layers: u32,
    /// 全部子资源的采样视图
    srv_view: Option<vk::ImageView>,
    /// 每个 mip 一个视图，用于存储图像和附件
    mip_views: Vec<vk::ImageView>,
}

impl VulkanTexture {
    fn mip_view(&self, mip: u32) -> Result<vk::ImageView> {
        self.mip_views.get(mip as usize).copied().ok_or_else(|| {
            RhiError::backend(BackendApi::Vulkan, "vkUpdateDescriptorSets", format!("texture has no view for mip {mip}"))
        })
    }

    fn range(&self, subresource: Subresource) -> vk::ImageSubresourceRange {
        match subresource {
            Subresource::All => vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
            Subresource::Index(index) => vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: index % self.mip_levels,
                level_count: 1,
                base_array_layer: index / self.mip_levels,
                layer_count: 1,
            },
        }
    }
}

pub struct VulkanShader {
    module: vk::ShaderModule,
}

pub struct VulkanPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

pub struct VulkanQueue {
    raw: vk::Queue,
    queue_type: QueueType,
}

pub struct VulkanCommandList {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    queue_type: QueueType,
}

/// 时间线信号量栅栏
pub struct VulkanFence {
    context: Arc<VulkanContext>,
    semaphore: vk::Semaphore,
}

impl GpuFence for VulkanFence {
    fn completed_value(&self) -> u64 {
        // SAFETY: 信号量在栅栏析构前一直有效
        unsafe { self.context.device.get_semaphore_counter_value(self.semaphore) }.unwrap_or(0)
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);

        // SAFETY: 同上
        match unsafe { self.context.device.wait_semaphores(&info, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(device_lost(value, timeout.unwrap_or_default())),
            Err(e) => Err(vk_error("vkWaitSemaphores", e)),
        }
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        // SAFETY: 最后一个同步点释放时不再有提交引用该信号量
        unsafe { self.context.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// 创建资源时使用的一次性提交
struct ImmediateSubmit {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

pub struct VulkanBackend {
    context: Arc<VulkanContext>,
    immediate: Mutex<ImmediateSubmit>,
    /// 同族队列可能是同一个 `vk::Queue`，提交需要外部同步
    submit_lock: Mutex<()>,
    sharing_families: Vec<u32>,
}

impl VulkanBackend {
    pub fn new(debug_layer: bool) -> Result<Self> {
        let context = Arc::new(VulkanContext::new(debug_layer)?);
        let immediate = create_immediate(&context)?;
        let sharing_families = context.families.unique();

        info!(adapter = %context.adapter_name, "Vulkan backend initialized");
        Ok(Self {
            context,
            immediate: Mutex::new(immediate),
            submit_lock: Mutex::new(()),
            sharing_families,
        })
    }

    fn device(&self) -> &ash::Device {
        &self.context.device
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        memory_type: MemoryType,
    ) -> Result<vk::DeviceMemory> {
        let (preferred, required) = match memory_type {
            MemoryType::DeviceLocal => (vk::MemoryPropertyFlags::DEVICE_LOCAL, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryType::Upload => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
            MemoryType::Readback => (
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        };
        let type_index = self
            .context
            .find_memory_type(requirements.memory_type_bits, preferred)
            .or_else(|| self.context.find_memory_type(requirements.memory_type_bits, required))
            .ok_or_else(|| {
                RhiError::backend(BackendApi::Vulkan, "vkAllocateMemory", format!("no memory type for {memory_type:?}"))
            })?;

        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        // SAFETY: allocate info 在调用期间有效
        unsafe { self.device().allocate_memory(&info, None) }.map_err(|e| vk_error("vkAllocateMemory", e))
    }

    fn sharing<'a>(&'a self) -> (vk::SharingMode, &'a [u32]) {
        if self.sharing_families.len() > 1 {
            (vk::SharingMode::CONCURRENT, &self.sharing_families)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        }
    }

    /// 在直接队列上录制并同步执行一段命令
    fn submit_immediate(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let immediate = self.immediate.lock();
        let device = self.device();
        let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        // SAFETY: 一次性命令缓冲区由互斥锁保护，等待栅栏后才会复用
        unsafe {
            device
                .reset_command_pool(immediate.pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| vk_error("vkResetCommandPool", e))?;
            device
                .begin_command_buffer(immediate.buffer, &begin)
                .map_err(|e| vk_error("vkBeginCommandBuffer", e))?;
            record(device, immediate.buffer);
            device
                .end_command_buffer(immediate.buffer)
                .map_err(|e| vk_error("vkEndCommandBuffer", e))?;

            let buffers = [immediate.buffer];
            let submit = vk::SubmitInfo::builder().command_buffers(&buffers);
            {
                let _guard = self.submit_lock.lock();
                device
                    .queue_submit(self.context.queue(QueueType::Direct), &[submit.build()], immediate.fence)
                    .map_err(|e| vk_error("vkQueueSubmit", e))?;
            }
            device
                .wait_for_fences(&[immediate.fence], true, u64::MAX)
                .map_err(|e| vk_error("vkWaitForFences", e))?;
            device
                .reset_fences(&[immediate.fence])
                .map_err(|e| vk_error("vkResetFences", e))?;
        }
        Ok(())
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        view_type: vk::ImageViewType,
        format: vk::Format,
        range: vk::ImageSubresourceRange,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(range);
        // SAFETY: 图像有效，范围在图像之内
        unsafe { self.device().create_image_view(&info, None) }.map_err(|e| vk_error("vkCreateImageView", e))
    }

    fn create_texture_views(&self, texture: &mut VulkanTexture, desc: &TextureDescriptor) -> Result<()> {
        let format = conv::texture_format(desc.format);
        let layers = desc.array_layers();

        if desc.usage.contains(TextureUsage::SAMPLED) {
            // 采样视图只能包含一个方面
            let mut range = texture.range(Subresource::All);
            if desc.format.is_depth() {
                range.aspect_mask = vk::ImageAspectFlags::DEPTH;
            }
            let view_type = conv::image_view_type(desc.texture_type, layers);
            texture.srv_view = Some(self.create_image_view(texture.image, view_type, format, range)?);
        }

        if desc
            .usage
            .intersects(TextureUsage::STORAGE | TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL)
        {
            // 存储图像不能使用立方体视图
            let view_type = match desc.texture_type {
                TextureType::TextureCube => vk::ImageViewType::TYPE_2D_ARRAY,
                other => conv::image_view_type(other, layers),
            };
            for mip in 0..desc.mip_levels {
                let range = vk::ImageSubresourceRange {
                    aspect_mask: texture.aspect,
                    base_mip_level: mip,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: layers,
                };
                let view = self.create_image_view(texture.image, view_type, format, range)?;
                texture.mip_views.push(view);
            }
        }
        Ok(())
    }

    fn write_set(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        index: u32,
        ty: vk::DescriptorType,
        buffer_info: Option<vk::DescriptorBufferInfo>,
        image_info: Option<vk::DescriptorImageInfo>,
    ) {
        let buffer_infos: Vec<_> = buffer_info.into_iter().collect();
        let image_infos: Vec<_> = image_info.into_iter().collect();
        let mut write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(index)
            .descriptor_type(ty);
        if !buffer_infos.is_empty() {
            write = write.buffer_info(&buffer_infos);
        }
        if !image_infos.is_empty() {
            write = write.image_info(&image_infos);
        }
        // SAFETY: 集合使用 UPDATE_AFTER_BIND，写入未被 GPU 使用的槽位
        unsafe { self.device().update_descriptor_sets(&[write.build()], &[]) };
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let immediate = self.immediate.get_mut();
        // SAFETY: 设备空闲后销毁一次性提交对象
        unsafe {
            let _ = self.context.device.device_wait_idle();
            self.context.device.destroy_fence(immediate.fence, None);
            self.context.device.destroy_command_pool(immediate.pool, None);
        }
        debug!("Vulkan backend dropped");
    }
}

fn create_immediate(context: &VulkanContext) -> Result<ImmediateSubmit> {
    let device = &context.device;
    let pool_info = vk::CommandPoolCreateInfo::builder().queue_family_index(context.families.direct);
    // SAFETY: create info 在调用期间有效
    unsafe {
        let pool = device
            .create_command_pool(&pool_info, None)
            .map_err(|e| vk_error("vkCreateCommandPool", e))?;
        let alloc = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match device.allocate_command_buffers(&alloc) {
            Ok(buffers) => buffers[0],
            Err(e) => {
                device.destroy_command_pool(pool, None);
                return Err(vk_error("vkAllocateCommandBuffers", e));
            }
        };
        let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_command_pool(pool, None);
                return Err(vk_error("vkCreateFence", e));
            }
        };
        Ok(ImmediateSubmit { pool, buffer, fence })
    }
}

impl RenderBackend for VulkanBackend {
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type Shader = VulkanShader;
    type Pipeline = VulkanPipeline;
    type DescriptorHeap = VulkanDescriptorHeap;
    type Queue = VulkanQueue;
    type Fence = VulkanFence;
    type CommandList = VulkanCommandList;

    fn api(&self) -> BackendApi {
        BackendApi::Vulkan
    }

    fn adapter_name(&self) -> &str {
        &self.context.adapter_name
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<VulkanBuffer> {
        let (sharing_mode, families) = self.sharing();
        let info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(conv::buffer_usage(desc.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(families);

        let device = self.device();
        // SAFETY: create info 在调用期间有效，失败时释放已创建的对象
        unsafe {
            let buffer = device.create_buffer(&info, None).map_err(|e| vk_error("vkCreateBuffer", e))?;
            let requirements = device.get_buffer_memory_requirements(buffer);
            let memory = match self.allocate_memory(requirements, desc.memory_type) {
                Ok(memory) => memory,
                Err(err) => {
                    device.destroy_buffer(buffer, None);
                    return Err(err);
                }
            };
            if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
                return Err(vk_error("vkBindBufferMemory", e));
            }

            let mapped = if desc.memory_type.is_host_visible() {
                match device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) {
                    Ok(ptr) => NonNull::new(ptr.cast::<u8>()),
                    Err(e) => {
                        device.destroy_buffer(buffer, None);
                        device.free_memory(memory, None);
                        return Err(vk_error("vkMapMemory", e));
                    }
                }
            } else {
                None
            };

            trace!(size = desc.size, memory = ?desc.memory_type, "Vulkan buffer created");
            Ok(VulkanBuffer {
                buffer,
                memory,
                size: desc.size,
                mapped,
            })
        }
    }

    fn destroy_buffer(&self, buffer: VulkanBuffer) {
        // SAFETY: 调用方保证 GPU 不再使用；释放内存会隐式解除映射
        unsafe {
            self.device().destroy_buffer(buffer.buffer, None);
            self.device().free_memory(buffer.memory, None);
        }
    }

    fn map_buffer(&self, buffer: &VulkanBuffer) -> Result<Option<NonNull<u8>>> {
        Ok(buffer.mapped)
    }

    fn buffer_gpu_address(&self, _buffer: &VulkanBuffer) -> u64 {
        0
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<VulkanTexture> {
        let (sharing_mode, families) = self.sharing();
        let depth = match desc.texture_type {
            TextureType::Texture3D => desc.depth_or_array_layers,
            _ => 1,
        };
        let flags = match desc.texture_type {
            TextureType::TextureCube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        };
        let info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(conv::image_type(desc.texture_type))
            .format(conv::texture_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conv::image_usage(desc.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = self.device();
        // SAFETY: create info 在调用期间有效
        let image = unsafe { device.create_image(&info, None) }.map_err(|e| vk_error("vkCreateImage", e))?;
        // SAFETY: 图像刚刚创建
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match self.allocate_memory(requirements, MemoryType::DeviceLocal) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let mut texture = VulkanTexture {
            image,
            memory,
            aspect: conv::aspect_mask(desc.format),
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers(),
            srv_view: None,
            mip_views: Vec::new(),
        };

        // SAFETY: 内存按图像需求分配
        let result = unsafe { device.bind_image_memory(image, memory, 0) }
            .map_err(|e| vk_error("vkBindImageMemory", e))
            .and_then(|()| self.create_texture_views(&mut texture, desc))
            .and_then(|()| {
                let barrier = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::GENERAL)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(texture.range(Subresource::All))
                    .build();
                self.submit_immediate(|device, cb| unsafe {
                    device.cmd_pipeline_barrier(
                        cb,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                })
            });

        match result {
            Ok(()) => {
                trace!(
                    width = desc.width,
                    height = desc.height,
                    mips = desc.mip_levels,
                    layers = texture.array_layers,
                    "Vulkan texture created"
                );
                Ok(texture)
            }
            Err(err) => {
                self.destroy_texture(texture);
                Err(err)
            }
        }
    }

    fn destroy_texture(&self, texture: VulkanTexture) {
        // SAFETY: 调用方保证 GPU 不再使用
        unsafe {
            for view in texture.srv_view.into_iter().chain(texture.mip_views) {
                self.device().destroy_image_view(view, None);
            }
            self.device().destroy_image(texture.image, None);
            self.device().free_memory(texture.memory, None);
        }
    }

    fn create_shader(&self, desc: &ShaderDescriptor) -> Result<VulkanShader> {
        let code = ash::util::read_spv(&mut Cursor::new(&desc.bytecode))
            .map_err(|e| RhiError::backend(BackendApi::Vulkan, "read_spv", e))?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&code);
        // SAFETY: SPIR-V 已按字对齐读入
        let module = unsafe { self.device().create_shader_module(&info, None) }
            .map_err(|e| vk_error("vkCreateShaderModule", e))?;
        Ok(VulkanShader { module })
    }

    fn destroy_shader(&self, shader: VulkanShader) {
        // SAFETY: 管线创建后不再需要着色器模块
        unsafe { self.device().destroy_shader_module(shader.module, None) };
    }

    fn create_compute_pipeline(
        &self,
        shader: &VulkanShader,
        entry_point: &str,
        _layout: &BindingLayout,
        resource_heap: &VulkanDescriptorHeap,
        sampler_heap: &VulkanDescriptorHeap,
    ) -> Result<VulkanPipeline> {
        let (Some(resources), Some(samplers)) = (resource_heap.bindless(), sampler_heap.bindless()) else {
            return Err(RhiError::backend(
                BackendApi::Vulkan,
                "vkCreatePipelineLayout",
                "pipeline requires shader-visible heaps",
            ));
        };

        let set_layouts = [resources.layout, samplers.layout];
        let push_constants = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: std::mem::size_of::<u32>() as u32,
        }];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);

        let device = self.device();
        // SAFETY: create info 在调用期间有效
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| vk_error("vkCreatePipelineLayout", e))?;

        let entry = CString::new(entry_point)
            .map_err(|e| RhiError::backend(BackendApi::Vulkan, "vkCreateComputePipelines", e))?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(&entry);
        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage.build())
            .layout(layout);

        // SAFETY: 同上
        match unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[info.build()], None) } {
            Ok(pipelines) => Ok(VulkanPipeline {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(vk_error("vkCreateComputePipelines", e))
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: VulkanPipeline) {
        // SAFETY: 调用方保证 GPU 不再使用
        unsafe {
            self.device().destroy_pipeline(pipeline.pipeline, None);
            self.device().destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    fn descriptor_increment_size(&self, _heap_type: DescriptorHeapType) -> u32 {
        1
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDescriptor) -> Result<VulkanDescriptorHeap> {
        VulkanDescriptorHeap::create(self.device(), desc)
    }

    fn descriptor_heap_base(&self, heap: &VulkanDescriptorHeap) -> (usize, Option<u64>) {
        // 句柄即数组下标
        (0, heap.bindless().map(|_| 0))
    }

    fn destroy_descriptor_heap(&self, heap: VulkanDescriptorHeap) {
        heap.destroy(self.device());
    }

    fn write_descriptor(
        &self,
        heap: &mut VulkanDescriptorHeap,
        slot: &DescriptorHandle,
        view: DescriptorView<'_, Self>,
    ) -> Result<()> {
        let index = slot.index;
        match view {
            DescriptorView::RenderTarget { texture, mip, .. } | DescriptorView::DepthStencil { texture, mip, .. } => {
                heap.set_view(index, texture.mip_view(mip)?);
                return Ok(());
            }
            DescriptorView::Sampler(desc) => {
                let sampler = create_sampler(self.device(), desc, self.context.sampler_anisotropy)?;
                if let Some(old) = heap.replace_sampler(index, sampler) {
                    // SAFETY: 槽位只有在上一次使用完成后才会被重新分配
                    unsafe { self.device().destroy_sampler(old, None) };
                }
                let set = heap.bindless().map(|s| s.set).unwrap_or_default();
                let info = vk::DescriptorImageInfo {
                    sampler,
                    ..Default::default()
                };
                self.write_set(set, SAMPLER_BINDING, index, vk::DescriptorType::SAMPLER, None, Some(info));
                return Ok(());
            }
            _ => {}
        }

        let set = heap
            .bindless()
            .map(|s| s.set)
            .ok_or_else(|| RhiError::backend(BackendApi::Vulkan, "vkUpdateDescriptorSets", "heap is not shader visible"))?;

        match view {
            DescriptorView::ConstantBuffer { buffer, offset, size }
            | DescriptorView::BufferSrv { buffer, offset, size, .. }
            | DescriptorView::BufferUav { buffer, offset, size, .. } => {
                let info = vk::DescriptorBufferInfo {
                    buffer: buffer.buffer,
                    offset,
                    range: size.min(buffer.size.saturating_sub(offset)),
                };
                self.write_set(set, STORAGE_BUFFER_BINDING, index, vk::DescriptorType::STORAGE_BUFFER, Some(info), None);
            }
            DescriptorView::TextureSrv { texture, .. } => {
                let view = texture.srv_view.ok_or_else(|| {
                    RhiError::backend(BackendApi::Vulkan, "vkUpdateDescriptorSets", "texture is not sampled")
                })?;
                let info = vk::DescriptorImageInfo {
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                    ..Default::default()
                };
                self.write_set(set, SAMPLED_IMAGE_BINDING, index, vk::DescriptorType::SAMPLED_IMAGE, None, Some(info));
            }
            DescriptorView::TextureUav { texture, mip, .. } => {
                let info = vk::DescriptorImageInfo {
                    image_view: texture.mip_view(mip)?,
                    image_layout: vk::ImageLayout::GENERAL,
                    ..Default::default()
                };
                self.write_set(set, STORAGE_IMAGE_BINDING, index, vk::DescriptorType::STORAGE_IMAGE, None, Some(info));
            }
            DescriptorView::RenderTarget { .. } | DescriptorView::DepthStencil { .. } | DescriptorView::Sampler(_) => {}
        }
        Ok(())
    }

    fn create_queue(&self, queue_type: QueueType) -> Result<VulkanQueue> {
        Ok(VulkanQueue {
            raw: self.context.queue(queue_type),
            queue_type,
        })
    }

    fn create_fence(&self, initial_value: u64) -> Result<VulkanFence> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        // SAFETY: create info 在调用期间有效
        let semaphore = unsafe { self.device().create_semaphore(&info, None) }
            .map_err(|e| vk_error("vkCreateSemaphore", e))?;
        Ok(VulkanFence {
            context: Arc::clone(&self.context),
            semaphore,
        })
    }

    fn queue_signal(&self, queue: &VulkanQueue, fence: &VulkanFence, value: u64) -> Result<()> {
        let semaphores = [fence.semaphore];
        let values = [value];
        let mut timeline = vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline);

        let _guard = self.submit_lock.lock();
        // SAFETY: 提交期间持有队列锁
        unsafe { self.device().queue_submit(queue.raw, &[submit.build()], vk::Fence::null()) }
            .map_err(|e| vk_error("vkQueueSubmit", e))
    }

    fn queue_wait(&self, queue: &VulkanQueue, fence: &VulkanFence, value: u64) -> Result<()> {
        let semaphores = [fence.semaphore];
        let values = [value];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let mut timeline = vk::TimelineSemaphoreSubmitInfo::builder().wait_semaphore_values(&values);
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .push_next(&mut timeline);

        trace!(queue = %queue.queue_type, value, "Vulkan queue wait");
        let _guard = self.submit_lock.lock();
        // SAFETY: 同上
        unsafe { self.device().queue_submit(queue.raw, &[submit.build()], vk::Fence::null()) }
            .map_err(|e| vk_error("vkQueueSubmit", e))
    }

    fn create_command_list(&self, queue_type: QueueType) -> Result<VulkanCommandList> {
        let device = self.device();
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.context.families.family(queue_type));
        // SAFETY: create info 在调用期间有效
        unsafe {
            let pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| vk_error("vkCreateCommandPool", e))?;
            let alloc = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            match device.allocate_command_buffers(&alloc) {
                Ok(buffers) => Ok(VulkanCommandList {
                    pool,
                    buffer: buffers[0],
                    queue_type,
                }),
                Err(e) => {
                    device.destroy_command_pool(pool, None);
                    Err(vk_error("vkAllocateCommandBuffers", e))
                }
            }
        }
    }

    fn destroy_command_list(&self, list: VulkanCommandList) {
        // SAFETY: 销毁命令池会一并释放其中的命令缓冲区
        unsafe { self.device().destroy_command_pool(list.pool, None) };
    }

    fn begin_command_list(&self, list: &mut VulkanCommandList) -> Result<()> {
        let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: 调用方保证上一次提交已完成
        unsafe {
            self.device()
                .reset_command_pool(list.pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| vk_error("vkResetCommandPool", e))?;
            self.device()
                .begin_command_buffer(list.buffer, &begin)
                .map_err(|e| vk_error("vkBeginCommandBuffer", e))
        }
    }

    fn end_command_list(&self, list: &mut VulkanCommandList) -> Result<()> {
        // SAFETY: 命令缓冲区处于录制状态
        unsafe { self.device().end_command_buffer(list.buffer) }.map_err(|e| vk_error("vkEndCommandBuffer", e))
    }

    fn submit(&self, queue: &VulkanQueue, list: &VulkanCommandList) -> Result<()> {
        let buffers = [list.buffer];
        let submit = vk::SubmitInfo::builder().command_buffers(&buffers);
        let _guard = self.submit_lock.lock();
        // SAFETY: 命令缓冲区已结束录制
        unsafe { self.device().queue_submit(queue.raw, &[submit.build()], vk::Fence::null()) }
            .map_err(|e| vk_error("vkQueueSubmit", e))
    }

    fn cmd_resource_barriers(&self, list: &mut VulkanCommandList, barriers: &[ResolvedBarrier<'_, Self>]) {
        let queue_type = list.queue_type;
        let access_mask = conv::supported_access(queue_type);
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        let mut memory = Vec::new();
        let mut buffers = Vec::new();
        let mut images = Vec::new();

        for barrier in barriers {
            match barrier {
                ResolvedBarrier::Transition {
                    resource,
                    subresource,
                    before,
                    after,
                } => {
                    let (src_stage, src_access) = conv::state_scope(*before);
                    let (dst_stage, dst_access) = conv::state_scope(*after);
                    src_stages |= src_stage;
                    dst_stages |= dst_stage;
                    match resource {
                        RawResource::Buffer(buffer, _) => buffers.push(
                            vk::BufferMemoryBarrier::builder()
                                .src_access_mask(src_access & access_mask)
                                .dst_access_mask(dst_access & access_mask)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .buffer(buffer.buffer)
                                .offset(0)
                                .size(vk::WHOLE_SIZE)
                                .build(),
                        ),
                        RawResource::Texture(texture, _) => images.push(
                            vk::ImageMemoryBarrier::builder()
                                .src_access_mask(src_access & access_mask)
                                .dst_access_mask(dst_access & access_mask)
                                .old_layout(vk::ImageLayout::GENERAL)
                                .new_layout(vk::ImageLayout::GENERAL)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .image(texture.image)
                                .subresource_range(texture.range(*subresource))
                                .build(),
                        ),
                    }
                }
                ResolvedBarrier::Uav { .. } => {
                    src_stages |= vk::PipelineStageFlags::COMPUTE_SHADER;
                    dst_stages |= vk::PipelineStageFlags::COMPUTE_SHADER;
                    memory.push(
                        vk::MemoryBarrier::builder()
                            .src_access_mask(vk::AccessFlags::SHADER_WRITE & access_mask)
                            .dst_access_mask((vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE) & access_mask)
                            .build(),
                    );
                }
            }
        }

        if memory.is_empty() && buffers.is_empty() && images.is_empty() {
            return;
        }

        let src = conv::mask_stages(src_stages, queue_type, vk::PipelineStageFlags::TOP_OF_PIPE);
        let dst = conv::mask_stages(dst_stages, queue_type, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        // SAFETY: 命令缓冲区处于录制状态
        unsafe {
            self.device().cmd_pipeline_barrier(
                list.buffer,
                src,
                dst,
                vk::DependencyFlags::empty(),
                &memory,
                &buffers,
                &images,
            );
        }
    }

    fn cmd_copy_buffer(
        &self,
        list: &mut VulkanCommandList,
        src: &VulkanBuffer,
        src_offset: u64,
        dst: &VulkanBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        // SAFETY: 范围已由上层检查
        unsafe { self.device().cmd_copy_buffer(list.buffer, src.buffer, dst.buffer, &[region]) };
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: &mut VulkanCommandList,
        src: &VulkanBuffer,
        footprint: &TextureFootprint,
        dst: &VulkanTexture,
        dst_desc: &TextureDescriptor,
    ) {
        // 深度模板格式一次只能拷贝一个方面
        let aspect = if dst_desc.format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let bytes_per_pixel = u64::from(dst_desc.format.bytes_per_pixel().max(1));
        let region = vk::BufferImageCopy {
            buffer_offset: footprint.buffer_offset,
            buffer_row_length: (footprint.row_pitch / bytes_per_pixel) as u32,
            buffer_image_height: footprint.height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: footprint.mip_level,
                base_array_layer: footprint.array_layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: footprint.width,
                height: footprint.height,
                depth: footprint.depth,
            },
        };
        // SAFETY: 图像处于 GENERAL 布局
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                list.buffer,
                src.buffer,
                dst.image,
                vk::ImageLayout::GENERAL,
                &[region],
            );
        }
    }

    fn cmd_bind_compute(
        &self,
        list: &mut VulkanCommandList,
        pipeline: &VulkanPipeline,
        resource_heap: &VulkanDescriptorHeap,
        sampler_heap: &VulkanDescriptorHeap,
        table: Option<&DescriptorHandle>,
    ) {
        let device = self.device();
        let sets: Vec<vk::DescriptorSet> = [resource_heap, sampler_heap]
            .iter()
            .filter_map(|heap| heap.bindless().map(|s| s.set))
            .collect();
        let table_base: u32 = table.map_or(0, |t| t.index);

        // SAFETY: 命令缓冲区处于录制状态，集合布局与管线布局一致
        unsafe {
            device.cmd_bind_pipeline(list.buffer, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                list.buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &sets,
                &[],
            );
            device.cmd_push_constants(
                list.buffer,
                pipeline.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&table_base),
            );
        }
    }

    fn cmd_dispatch(&self, list: &mut VulkanCommandList, x: u32, y: u32, z: u32) {
        // SAFETY: 命令缓冲区处于录制状态
        unsafe { self.device().cmd_dispatch(list.buffer, x, y, z) };
    }

    fn wait_idle(&self) -> Result<()> {
        // SAFETY: 设备有效
        unsafe { self.device().device_wait_idle() }.map_err(|e| vk_error("vkDeviceWaitIdle", e))
    }
}
