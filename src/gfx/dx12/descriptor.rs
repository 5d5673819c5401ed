//! DirectX 12 描述符堆
//!
//! 原生堆与上层的槽位分配一一对应，这里只负责创建堆和把视图写入槽位。

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::backend::{Dx12Buffer, Dx12Texture};
use super::context::dx_error;
use super::conv;
use crate::core::error::Result;
use crate::renderer::descriptor::{DescriptorHeapDescriptor, DescriptorHeapType};
use crate::renderer::resource::{TextureDescriptor, TextureType};

pub fn heap_type(heap_type: DescriptorHeapType) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match heap_type {
        DescriptorHeapType::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapType::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapType::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapType::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

pub struct Dx12DescriptorHeap {
    pub heap: ID3D12DescriptorHeap,
    pub heap_type: DescriptorHeapType,
    pub shader_visible: bool,
}

impl Dx12DescriptorHeap {
    pub fn create(device: &ID3D12Device, desc: &DescriptorHeapDescriptor) -> Result<Self> {
        let flags = if desc.shader_visible {
            D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
        } else {
            D3D12_DESCRIPTOR_HEAP_FLAG_NONE
        };
        let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: heap_type(desc.heap_type),
            NumDescriptors: desc.capacity.total().max(1),
            Flags: flags,
            NodeMask: 0,
        };

        // SAFETY: 描述在调用期间有效
        unsafe {
            let heap: ID3D12DescriptorHeap =
                device.CreateDescriptorHeap(&heap_desc).map_err(|e| dx_error("CreateDescriptorHeap", e))?;

            // 设置调试名称
            if let Some(name) = &desc.name {
                let wide_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
                let _ = heap.SetName(windows::core::PCWSTR(wide_name.as_ptr()));
            }

            Ok(Self {
                heap,
                heap_type: desc.heap_type,
                shader_visible: desc.shader_visible,
            })
        }
    }

    pub fn base(&self) -> (usize, Option<u64>) {
        // SAFETY: 堆有效
        unsafe {
            let cpu = self.heap.GetCPUDescriptorHandleForHeapStart().ptr;
            let gpu = self
                .shader_visible
                .then(|| self.heap.GetGPUDescriptorHandleForHeapStart().ptr);
            (cpu, gpu)
        }
    }
}

fn cpu(ptr: usize) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE { ptr }
}

pub unsafe fn write_cbv(device: &ID3D12Device, dest: usize, buffer: &Dx12Buffer, offset: u64, size: u64) {
    let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
        BufferLocation: buffer.gpu_address + offset,
        SizeInBytes: size as u32,
    };
    device.CreateConstantBufferView(Some(&desc), cpu(dest));
}

/// `stride` 为 0 时写入原始（字节地址）缓冲区视图
pub unsafe fn write_buffer_srv(
    device: &ID3D12Device,
    dest: usize,
    buffer: &Dx12Buffer,
    offset: u64,
    size: u64,
    stride: u32,
) {
    let (format, element_size, flags) = if stride == 0 {
        (DXGI_FORMAT_R32_TYPELESS, 4, D3D12_BUFFER_SRV_FLAG_RAW)
    } else {
        (DXGI_FORMAT_UNKNOWN, stride, D3D12_BUFFER_SRV_FLAG_NONE)
    };
    let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
        Format: format,
        ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
        Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
            Buffer: D3D12_BUFFER_SRV {
                FirstElement: offset / u64::from(element_size),
                NumElements: (size / u64::from(element_size)) as u32,
                StructureByteStride: stride,
                Flags: flags,
            },
        },
    };
    device.CreateShaderResourceView(&buffer.resource, Some(&desc), cpu(dest));
}

pub unsafe fn write_buffer_uav(
    device: &ID3D12Device,
    dest: usize,
    buffer: &Dx12Buffer,
    offset: u64,
    size: u64,
    stride: u32,
) {
    let (format, element_size, flags) = if stride == 0 {
        (DXGI_FORMAT_R32_TYPELESS, 4, D3D12_BUFFER_UAV_FLAG_RAW)
    } else {
        (DXGI_FORMAT_UNKNOWN, stride, D3D12_BUFFER_UAV_FLAG_NONE)
    };
    let desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
        Format: format,
        ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
            Buffer: D3D12_BUFFER_UAV {
                FirstElement: offset / u64::from(element_size),
                NumElements: (size / u64::from(element_size)) as u32,
                StructureByteStride: stride,
                CounterOffsetInBytes: 0,
                Flags: flags,
            },
        },
    };
    device.CreateUnorderedAccessView(&buffer.resource, None::<&ID3D12Resource>, Some(&desc), cpu(dest));
}

pub unsafe fn write_texture_srv(device: &ID3D12Device, dest: usize, texture: &Dx12Texture, desc: &TextureDescriptor) {
    let mips = desc.mip_levels;
    let layers = desc.array_layers();
    let (dimension, anonymous) = match desc.texture_type {
        TextureType::Texture1D => (
            D3D12_SRV_DIMENSION_TEXTURE1D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture1D: D3D12_TEX1D_SRV {
                    MostDetailedMip: 0,
                    MipLevels: mips,
                    ResourceMinLODClamp: 0.0,
                },
            },
        ),
        TextureType::Texture2D if layers == 1 => (
            D3D12_SRV_DIMENSION_TEXTURE2D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_SRV {
                    MostDetailedMip: 0,
                    MipLevels: mips,
                    PlaneSlice: 0,
                    ResourceMinLODClamp: 0.0,
                },
            },
        ),
        TextureType::Texture2D => (
            D3D12_SRV_DIMENSION_TEXTURE2DARRAY,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2DArray: D3D12_TEX2D_ARRAY_SRV {
                    MostDetailedMip: 0,
                    MipLevels: mips,
                    FirstArraySlice: 0,
                    ArraySize: layers,
                    PlaneSlice: 0,
                    ResourceMinLODClamp: 0.0,
                },
            },
        ),
        TextureType::TextureCube => (
            D3D12_SRV_DIMENSION_TEXTURECUBE,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                TextureCube: D3D12_TEXCUBE_SRV {
                    MostDetailedMip: 0,
                    MipLevels: mips,
                    ResourceMinLODClamp: 0.0,
                },
            },
        ),
        TextureType::Texture3D => (
            D3D12_SRV_DIMENSION_TEXTURE3D,
            D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture3D: D3D12_TEX3D_SRV {
                    MostDetailedMip: 0,
                    MipLevels: mips,
                    ResourceMinLODClamp: 0.0,
                },
            },
        ),
    };
    let view = D3D12_SHADER_RESOURCE_VIEW_DESC {
        Format: conv::srv_format(desc.format),
        ViewDimension: dimension,
        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
        Anonymous: anonymous,
    };
    device.CreateShaderResourceView(&texture.resource, Some(&view), cpu(dest));
}

pub unsafe fn write_texture_uav(
    device: &ID3D12Device,
    dest: usize,
    texture: &Dx12Texture,
    desc: &TextureDescriptor,
    mip: u32,
) {
    let layers = desc.array_layers();
    let (dimension, anonymous) = match desc.texture_type {
        TextureType::Texture1D => (
            D3D12_UAV_DIMENSION_TEXTURE1D,
            D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                Texture1D: D3D12_TEX1D_UAV { MipSlice: mip },
            },
        ),
        TextureType::Texture2D if layers == 1 => (
            D3D12_UAV_DIMENSION_TEXTURE2D,
            D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_UAV {
                    MipSlice: mip,
                    PlaneSlice: 0,
                },
            },
        ),
        TextureType::Texture2D | TextureType::TextureCube => (
            D3D12_UAV_DIMENSION_TEXTURE2DARRAY,
            D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                Texture2DArray: D3D12_TEX2D_ARRAY_UAV {
                    MipSlice: mip,
                    FirstArraySlice: 0,
                    ArraySize: layers,
                    PlaneSlice: 0,
                },
            },
        ),
        TextureType::Texture3D => (
            D3D12_UAV_DIMENSION_TEXTURE3D,
            D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                Texture3D: D3D12_TEX3D_UAV {
                    MipSlice: mip,
                    FirstWSlice: 0,
                    WSize: u32::MAX,
                },
            },
        ),
    };
    let view = D3D12_UNORDERED_ACCESS_VIEW_DESC {
        Format: conv::texture_format(desc.format),
        ViewDimension: dimension,
        Anonymous: anonymous,
    };
    device.CreateUnorderedAccessView(&texture.resource, None::<&ID3D12Resource>, Some(&view), cpu(dest));
}

pub unsafe fn write_rtv(device: &ID3D12Device, dest: usize, texture: &Dx12Texture, desc: &TextureDescriptor, mip: u32) {
    let layers = desc.array_layers();
    let (dimension, anonymous) = match desc.texture_type {
        TextureType::Texture1D => (
            D3D12_RTV_DIMENSION_TEXTURE1D,
            D3D12_RENDER_TARGET_VIEW_DESC_0 {
                Texture1D: D3D12_TEX1D_RTV { MipSlice: mip },
            },
        ),
        TextureType::Texture2D if layers == 1 => (
            D3D12_RTV_DIMENSION_TEXTURE2D,
            D3D12_RENDER_TARGET_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_RTV {
                    MipSlice: mip,
                    PlaneSlice: 0,
                },
            },
        ),
        TextureType::Texture2D | TextureType::TextureCube => (
            D3D12_RTV_DIMENSION_TEXTURE2DARRAY,
            D3D12_RENDER_TARGET_VIEW_DESC_0 {
                Texture2DArray: D3D12_TEX2D_ARRAY_RTV {
                    MipSlice: mip,
                    FirstArraySlice: 0,
                    ArraySize: layers,
                    PlaneSlice: 0,
                },
            },
        ),
        TextureType::Texture3D => (
            D3D12_RTV_DIMENSION_TEXTURE3D,
            D3D12_RENDER_TARGET_VIEW_DESC_0 {
                Texture3D: D3D12_TEX3D_RTV {
                    MipSlice: mip,
                    FirstWSlice: 0,
                    WSize: u32::MAX,
                },
            },
        ),
    };
    let view = D3D12_RENDER_TARGET_VIEW_DESC {
        Format: conv::texture_format(desc.format),
        ViewDimension: dimension,
        Anonymous: anonymous,
    };
    device.CreateRenderTargetView(&texture.resource, Some(&view), cpu(dest));
}

pub unsafe fn write_dsv(device: &ID3D12Device, dest: usize, texture: &Dx12Texture, desc: &TextureDescriptor, mip: u32) {
    let layers = desc.array_layers();
    let (dimension, anonymous) = if layers == 1 {
        (
            D3D12_DSV_DIMENSION_TEXTURE2D,
            D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_DSV { MipSlice: mip },
            },
        )
    } else {
        (
            D3D12_DSV_DIMENSION_TEXTURE2DARRAY,
            D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                Texture2DArray: D3D12_TEX2D_ARRAY_DSV {
                    MipSlice: mip,
                    FirstArraySlice: 0,
                    ArraySize: layers,
                },
            },
        )
    };
    let view = D3D12_DEPTH_STENCIL_VIEW_DESC {
        Format: conv::texture_format(desc.format),
        ViewDimension: dimension,
        Flags: D3D12_DSV_FLAG_NONE,
        Anonymous: anonymous,
    };
    device.CreateDepthStencilView(&texture.resource, Some(&view), cpu(dest));
}
