//! DirectX 12 图形后端实现
//!
//! 本模块把 [`RenderBackend`] 的操作直接映射到 D3D12：
//!
//! - 资源：`CreateCommittedResource`，上传 / 回读缓冲区持久映射
//! - 描述符：原生描述符堆，槽位由上层分配
//! - 同步：每个队列一个 `ID3D12Fence`
//! - 计算管线：根签名只包含一张描述符表，寄存器编号按绑定布局依次分配

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::context::{dx_error, Dx12Context, Dx12Fence};
use super::conv;
use super::descriptor::{self as views, Dx12DescriptorHeap};
use crate::core::error::{BackendApi, Result, RhiError};
use crate::renderer::backend_trait::{DescriptorView, RawResource, RenderBackend, ResolvedBarrier};
use crate::renderer::command::QueueType;
use crate::renderer::descriptor::{DescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapType};
use crate::renderer::resource::{
    BindingKind, BindingLayout, BufferDescriptor, ShaderDescriptor, TextureDescriptor, TextureFootprint,
};
use crate::renderer::state::Subresource;
use crate::renderer::sync::GpuFence;

pub struct Dx12Buffer {
    pub resource: ID3D12Resource,
    pub gpu_address: u64,
    mapped: Option<NonNull<u8>>,
}

pub struct Dx12Texture {
    pub resource: ID3D12Resource,
}

pub struct Dx12Shader {
    bytecode: Vec<u8>,
}

pub struct Dx12Pipeline {
    pso: ID3D12PipelineState,
    root_signature: ID3D12RootSignature,
    /// 根签名是否包含描述符表
    has_table: bool,
}

pub struct Dx12Queue {
    queue: ID3D12CommandQueue,
    queue_type: QueueType,
}

pub struct Dx12CommandList {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    queue_type: QueueType,
}

/// DirectX 12 图形后端
pub struct Dx12Backend {
    context: Dx12Context,
    /// 已创建的队列，`wait_idle` 需要逐个刷新
    queues: Mutex<Vec<ID3D12CommandQueue>>,
}

impl Dx12Backend {
    pub fn new(debug_layer: bool) -> Result<Self> {
        let context = Dx12Context::new(debug_layer)?;
        info!(adapter = %context.adapter_name, "DX12 Backend initialization complete");
        Ok(Self {
            context,
            queues: Mutex::new(Vec::new()),
        })
    }

    fn device(&self) -> &ID3D12Device {
        &self.context.device
    }

    fn create_committed(
        &self,
        heap_type: D3D12_HEAP_TYPE,
        desc: &D3D12_RESOURCE_DESC,
        initial_state: D3D12_RESOURCE_STATES,
    ) -> Result<ID3D12Resource> {
        let heap_props = D3D12_HEAP_PROPERTIES {
            Type: heap_type,
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        // SAFETY: 描述在调用期间有效
        unsafe {
            self.device()
                .CreateCommittedResource(&heap_props, D3D12_HEAP_FLAG_NONE, desc, initial_state, None, &mut resource)
                .map_err(|e| dx_error("CreateCommittedResource", e))?;
        }
        resource.ok_or_else(|| RhiError::backend(BackendApi::Dx12, "CreateCommittedResource", "no resource returned"))
    }

    fn create_root_signature(&self, layout: &BindingLayout) -> Result<(ID3D12RootSignature, bool)> {
        // 寄存器编号按 b# / t# / u# 分别递增
        let mut registers = [0u32; 3];
        let mut ranges = Vec::with_capacity(layout.slots().len());
        for slot in layout.slots().iter().filter(|s| s.count > 0) {
            let (range_type, register) = match slot.kind {
                BindingKind::ConstantBuffer => (D3D12_DESCRIPTOR_RANGE_TYPE_CBV, &mut registers[0]),
                BindingKind::ShaderResource => (D3D12_DESCRIPTOR_RANGE_TYPE_SRV, &mut registers[1]),
                BindingKind::UnorderedAccess => (D3D12_DESCRIPTOR_RANGE_TYPE_UAV, &mut registers[2]),
            };
            ranges.push(D3D12_DESCRIPTOR_RANGE {
                RangeType: range_type,
                NumDescriptors: slot.count,
                BaseShaderRegister: *register,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
            });
            *register += slot.count;
        }

        let parameters: Vec<D3D12_ROOT_PARAMETER> = if ranges.is_empty() {
            Vec::new()
        } else {
            vec![D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                        NumDescriptorRanges: ranges.len() as u32,
                        pDescriptorRanges: ranges.as_ptr(),
                    },
                },
                ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
            }]
        };

        let desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            NumStaticSamplers: 0,
            pStaticSamplers: std::ptr::null(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_NONE,
        };

        // SAFETY: 描述引用的数组在调用期间有效
        unsafe {
            let mut signature = None;
            D3D12SerializeRootSignature(&desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut signature, None)
                .map_err(|e| dx_error("D3D12SerializeRootSignature", e))?;
            let signature = signature.ok_or_else(|| {
                RhiError::backend(BackendApi::Dx12, "D3D12SerializeRootSignature", "no blob returned")
            })?;
            let root_signature: ID3D12RootSignature = self
                .device()
                .CreateRootSignature(
                    0,
                    std::slice::from_raw_parts(signature.GetBufferPointer() as *const u8, signature.GetBufferSize()),
                )
                .map_err(|e| dx_error("CreateRootSignature", e))?;
            Ok((root_signature, !parameters.is_empty()))
        }
    }
}

/// 不增加引用计数地借用 COM 指针放进屏障结构
///
/// # Safety
///
/// 返回值不能被析构，且使用期间 `resource` 必须存活。
unsafe fn borrow_resource(resource: &ID3D12Resource) -> ManuallyDrop<Option<ID3D12Resource>> {
    std::mem::transmute_copy(resource)
}

fn raw_resource<'a>(resource: &'a RawResource<'_, Dx12Backend>) -> &'a ID3D12Resource {
    match resource {
        RawResource::Buffer(buffer, _) => &buffer.resource,
        RawResource::Texture(texture, _) => &texture.resource,
    }
}

impl RenderBackend for Dx12Backend {
    type Buffer = Dx12Buffer;
    type Texture = Dx12Texture;
    type Shader = Dx12Shader;
    type Pipeline = Dx12Pipeline;
    type DescriptorHeap = Dx12DescriptorHeap;
    type Queue = Dx12Queue;
    type Fence = Dx12Fence;
    type CommandList = Dx12CommandList;

    fn api(&self) -> BackendApi {
        BackendApi::Dx12
    }

    fn adapter_name(&self) -> &str {
        &self.context.adapter_name
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Dx12Buffer> {
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: desc.size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: conv::buffer_flags(desc.usage),
        };
        let resource = self.create_committed(
            conv::heap_type(desc.memory_type),
            &resource_desc,
            conv::initial_buffer_state(desc.memory_type),
        )?;

        // SAFETY: 资源有效；上传和回读堆可以持久映射
        unsafe {
            if let Some(name) = &desc.name {
                let wide_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
                let _ = resource.SetName(windows::core::PCWSTR(wide_name.as_ptr()));
            }

            let mapped = if desc.memory_type.is_host_visible() {
                let mut data: *mut c_void = std::ptr::null_mut();
                resource.Map(0, None, Some(&mut data)).map_err(|e| dx_error("Map", e))?;
                NonNull::new(data.cast::<u8>())
            } else {
                None
            };

            trace!(size = desc.size, memory = ?desc.memory_type, "DX12 buffer created");
            Ok(Dx12Buffer {
                gpu_address: resource.GetGPUVirtualAddress(),
                resource,
                mapped,
            })
        }
    }

    fn destroy_buffer(&self, buffer: Dx12Buffer) {
        if buffer.mapped.is_some() {
            // SAFETY: 映射在创建时建立
            unsafe { buffer.resource.Unmap(0, None) };
        }
    }

    fn map_buffer(&self, buffer: &Dx12Buffer) -> Result<Option<NonNull<u8>>> {
        Ok(buffer.mapped)
    }

    fn buffer_gpu_address(&self, buffer: &Dx12Buffer) -> u64 {
        buffer.gpu_address
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<Dx12Texture> {
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: conv::resource_dimension(desc.texture_type),
            Alignment: 0,
            Width: u64::from(desc.width),
            Height: desc.height,
            DepthOrArraySize: desc.depth_or_array_layers as u16,
            MipLevels: desc.mip_levels as u16,
            Format: conv::resource_format(desc.format, desc.usage),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: conv::texture_flags(desc.usage),
        };
        let resource =
            self.create_committed(D3D12_HEAP_TYPE_DEFAULT, &resource_desc, D3D12_RESOURCE_STATE_COMMON)?;

        if let Some(name) = &desc.name {
            let wide_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
            // SAFETY: 名称在调用期间有效
            let _ = unsafe { resource.SetName(windows::core::PCWSTR(wide_name.as_ptr())) };
        }
        trace!(width = desc.width, height = desc.height, mips = desc.mip_levels, "DX12 texture created");
        Ok(Dx12Texture { resource })
    }

    fn destroy_texture(&self, _texture: Dx12Texture) {}

    fn create_shader(&self, desc: &ShaderDescriptor) -> Result<Dx12Shader> {
        Ok(Dx12Shader {
            bytecode: desc.bytecode.clone(),
        })
    }

    fn destroy_shader(&self, _shader: Dx12Shader) {}

    fn create_compute_pipeline(
        &self,
        shader: &Dx12Shader,
        _entry_point: &str,
        layout: &BindingLayout,
        _resource_heap: &Dx12DescriptorHeap,
        _sampler_heap: &Dx12DescriptorHeap,
    ) -> Result<Dx12Pipeline> {
        let (root_signature, has_table) = self.create_root_signature(layout)?;

        let desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
            CS: D3D12_SHADER_BYTECODE {
                pShaderBytecode: shader.bytecode.as_ptr() as *const c_void,
                BytecodeLength: shader.bytecode.len(),
            },
            ..Default::default()
        };
        // SAFETY: 描述在调用期间有效
        let result = unsafe { self.device().CreateComputePipelineState(&desc) };
        drop(ManuallyDrop::into_inner(desc.pRootSignature));

        let pso: ID3D12PipelineState = result.map_err(|e| dx_error("CreateComputePipelineState", e))?;
        Ok(Dx12Pipeline {
            pso,
            root_signature,
            has_table,
        })
    }

    fn destroy_pipeline(&self, _pipeline: Dx12Pipeline) {}

    fn descriptor_increment_size(&self, heap_type: DescriptorHeapType) -> u32 {
        // SAFETY: 设备有效
        unsafe { self.device().GetDescriptorHandleIncrementSize(views::heap_type(heap_type)) }
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDescriptor) -> Result<Dx12DescriptorHeap> {
        Dx12DescriptorHeap::create(self.device(), desc)
    }

    fn descriptor_heap_base(&self, heap: &Dx12DescriptorHeap) -> (usize, Option<u64>) {
        heap.base()
    }

    fn destroy_descriptor_heap(&self, _heap: Dx12DescriptorHeap) {}

    fn write_descriptor(
        &self,
        heap: &mut Dx12DescriptorHeap,
        slot: &DescriptorHandle,
        view: DescriptorView<'_, Self>,
    ) -> Result<()> {
        if view.heap_type() != heap.heap_type {
            return Err(RhiError::backend(
                BackendApi::Dx12,
                "CreateView",
                format!("{} view written into {} heap", view.heap_type(), heap.heap_type),
            ));
        }

        let device = self.device();
        let dest = slot.cpu.ptr;
        // SAFETY: 目标槽位由上层分配，视图引用的资源有效
        unsafe {
            match view {
                DescriptorView::ConstantBuffer { buffer, offset, size } => {
                    views::write_cbv(device, dest, buffer, offset, size)
                }
                DescriptorView::BufferSrv {
                    buffer,
                    offset,
                    size,
                    stride,
                } => views::write_buffer_srv(device, dest, buffer, offset, size, stride),
                DescriptorView::BufferUav {
                    buffer,
                    offset,
                    size,
                    stride,
                } => views::write_buffer_uav(device, dest, buffer, offset, size, stride),
                DescriptorView::TextureSrv { texture, desc } => views::write_texture_srv(device, dest, texture, desc),
                DescriptorView::TextureUav { texture, desc, mip } => {
                    views::write_texture_uav(device, dest, texture, desc, mip)
                }
                DescriptorView::RenderTarget { texture, desc, mip } => views::write_rtv(device, dest, texture, desc, mip),
                DescriptorView::DepthStencil { texture, desc, mip } => views::write_dsv(device, dest, texture, desc, mip),
                DescriptorView::Sampler(desc) => {
                    let sampler = conv::sampler_desc(desc);
                    device.CreateSampler(&sampler, D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dest });
                }
            }
        }
        Ok(())
    }

    fn create_queue(&self, queue_type: QueueType) -> Result<Dx12Queue> {
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: conv::command_list_type(queue_type),
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        };
        // SAFETY: 描述在调用期间有效
        let queue: ID3D12CommandQueue =
            unsafe { self.device().CreateCommandQueue(&desc) }.map_err(|e| dx_error("CreateCommandQueue", e))?;
        self.queues.lock().push(queue.clone());
        debug!(queue = %queue_type, "DX12 command queue created");
        Ok(Dx12Queue { queue, queue_type })
    }

    fn create_fence(&self, initial_value: u64) -> Result<Dx12Fence> {
        Dx12Fence::new(self.device(), initial_value)
    }

    fn queue_signal(&self, queue: &Dx12Queue, fence: &Dx12Fence, value: u64) -> Result<()> {
        // SAFETY: 队列与栅栏有效
        unsafe { queue.queue.Signal(fence.raw(), value) }.map_err(|e| dx_error("Signal", e))
    }

    fn queue_wait(&self, queue: &Dx12Queue, fence: &Dx12Fence, value: u64) -> Result<()> {
        trace!(queue = %queue.queue_type, value, "DX12 queue wait");
        // SAFETY: 同上
        unsafe { queue.queue.Wait(fence.raw(), value) }.map_err(|e| dx_error("Wait", e))
    }

    fn create_command_list(&self, queue_type: QueueType) -> Result<Dx12CommandList> {
        let list_type = conv::command_list_type(queue_type);
        // SAFETY: 设备有效；新建的命令列表立即关闭，等待 begin 时重置
        unsafe {
            let allocator: ID3D12CommandAllocator = self
                .device()
                .CreateCommandAllocator(list_type)
                .map_err(|e| dx_error("CreateCommandAllocator", e))?;
            let list: ID3D12GraphicsCommandList = self
                .device()
                .CreateCommandList(0, list_type, &allocator, None::<&ID3D12PipelineState>)
                .map_err(|e| dx_error("CreateCommandList", e))?;
            list.Close().map_err(|e| dx_error("Close", e))?;
            Ok(Dx12CommandList {
                allocator,
                list,
                queue_type,
            })
        }
    }

    fn destroy_command_list(&self, _list: Dx12CommandList) {}

    fn begin_command_list(&self, list: &mut Dx12CommandList) -> Result<()> {
        // SAFETY: 调用方保证上一次提交已完成
        unsafe {
            list.allocator.Reset().map_err(|e| dx_error("ID3D12CommandAllocator::Reset", e))?;
            list.list
                .Reset(&list.allocator, None::<&ID3D12PipelineState>)
                .map_err(|e| dx_error("ID3D12GraphicsCommandList::Reset", e))
        }
    }

    fn end_command_list(&self, list: &mut Dx12CommandList) -> Result<()> {
        // SAFETY: 命令列表处于录制状态
        unsafe { list.list.Close() }.map_err(|e| dx_error("Close", e))
    }

    fn submit(&self, queue: &Dx12Queue, list: &Dx12CommandList) -> Result<()> {
        let command_list: ID3D12CommandList = list
            .list
            .cast()
            .map_err(|e| dx_error("QueryInterface", e))?;
        // SAFETY: 命令列表已关闭
        unsafe { queue.queue.ExecuteCommandLists(&[Some(command_list)]) };
        Ok(())
    }

    fn cmd_resource_barriers(&self, list: &mut Dx12CommandList, barriers: &[ResolvedBarrier<'_, Self>]) {
        if barriers.is_empty() {
            return;
        }

        // SAFETY: 屏障借用的资源在本次调用期间存活，结构体中的指针不会被析构
        let native: Vec<D3D12_RESOURCE_BARRIER> = barriers
            .iter()
            .map(|barrier| unsafe {
                match barrier {
                    ResolvedBarrier::Transition {
                        resource,
                        subresource,
                        before,
                        after,
                    } => D3D12_RESOURCE_BARRIER {
                        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                        Anonymous: D3D12_RESOURCE_BARRIER_0 {
                            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                                pResource: borrow_resource(raw_resource(resource)),
                                Subresource: match subresource {
                                    Subresource::All => D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                                    Subresource::Index(index) => *index,
                                },
                                StateBefore: conv::resource_state(*before),
                                StateAfter: conv::resource_state(*after),
                            }),
                        },
                    },
                    ResolvedBarrier::Uav { resource } => D3D12_RESOURCE_BARRIER {
                        Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
                        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                        Anonymous: D3D12_RESOURCE_BARRIER_0 {
                            UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                                pResource: match resource {
                                    Some(resource) => borrow_resource(raw_resource(resource)),
                                    None => ManuallyDrop::new(None),
                                },
                            }),
                        },
                    },
                }
            })
            .collect();

        // SAFETY: 命令列表处于录制状态
        unsafe { list.list.ResourceBarrier(&native) };
    }

    fn cmd_copy_buffer(
        &self,
        list: &mut Dx12CommandList,
        src: &Dx12Buffer,
        src_offset: u64,
        dst: &Dx12Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        // SAFETY: 范围已由上层检查
        unsafe {
            list.list
                .CopyBufferRegion(&dst.resource, dst_offset, &src.resource, src_offset, size)
        };
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: &mut Dx12CommandList,
        src: &Dx12Buffer,
        footprint: &TextureFootprint,
        dst: &Dx12Texture,
        dst_desc: &TextureDescriptor,
    ) {
        let subresource = dst_desc.subresource_index(footprint.mip_level, footprint.array_layer);
        // SAFETY: 位置结构只借用资源，调用期间资源存活
        unsafe {
            let dst_location = D3D12_TEXTURE_COPY_LOCATION {
                pResource: borrow_resource(&dst.resource),
                Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    SubresourceIndex: subresource,
                },
            };
            let src_location = D3D12_TEXTURE_COPY_LOCATION {
                pResource: borrow_resource(&src.resource),
                Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                        Offset: footprint.buffer_offset,
                        Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                            Format: conv::texture_format(dst_desc.format),
                            Width: footprint.width,
                            Height: footprint.height,
                            Depth: footprint.depth,
                            RowPitch: footprint.row_pitch as u32,
                        },
                    },
                },
            };
            list.list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None);
        }
    }

    fn cmd_bind_compute(
        &self,
        list: &mut Dx12CommandList,
        pipeline: &Dx12Pipeline,
        resource_heap: &Dx12DescriptorHeap,
        sampler_heap: &Dx12DescriptorHeap,
        table: Option<&DescriptorHandle>,
    ) {
        debug_assert!(list.queue_type.supports_compute());
        // SAFETY: 命令列表处于录制状态
        unsafe {
            list.list
                .SetDescriptorHeaps(&[Some(resource_heap.heap.clone()), Some(sampler_heap.heap.clone())]);
            list.list.SetComputeRootSignature(&pipeline.root_signature);
            list.list.SetPipelineState(&pipeline.pso);

            if pipeline.has_table {
                match table.and_then(|t| t.gpu) {
                    Some(gpu) => list
                        .list
                        .SetComputeRootDescriptorTable(0, D3D12_GPU_DESCRIPTOR_HANDLE { ptr: gpu.ptr }),
                    None => warn!("Compute pipeline expects a descriptor table but none was bound"),
                }
            }
        }
    }

    fn cmd_dispatch(&self, list: &mut Dx12CommandList, x: u32, y: u32, z: u32) {
        // SAFETY: 命令列表处于录制状态
        unsafe { list.list.Dispatch(x, y, z) };
    }

    fn wait_idle(&self) -> Result<()> {
        let queues = self.queues.lock().clone();
        for queue in queues {
            let fence = Dx12Fence::new(self.device(), 0)?;
            // SAFETY: 队列与栅栏有效
            unsafe { queue.Signal(fence.raw(), 1) }.map_err(|e| dx_error("Signal", e))?;
            fence.wait(1, None)?;
        }
        Ok(())
    }
}

impl Drop for Dx12Backend {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            warn!(error = %err, "Failed to flush DX12 queues during teardown");
        }
        debug!("DX12 backend dropped");
    }
}
