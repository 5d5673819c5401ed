//! 通用类型到 D3D12 类型的转换

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::renderer::command::QueueType;
use crate::renderer::resource::{
    AddressMode, BufferUsage, FilterMode, MemoryType, SamplerDescriptor, TextureFormat, TextureType, TextureUsage,
};
use crate::renderer::state::ResourceState;

/// 视图使用的格式
pub fn texture_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => DXGI_FORMAT_R8G8B8A8_UNORM_SRGB,
        TextureFormat::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        TextureFormat::R32Float => DXGI_FORMAT_R32_FLOAT,
        TextureFormat::R32Uint => DXGI_FORMAT_R32_UINT,
        TextureFormat::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        TextureFormat::Depth24PlusStencil8 => DXGI_FORMAT_D24_UNORM_S8_UINT,
        TextureFormat::Depth32Float => DXGI_FORMAT_D32_FLOAT,
    }
}

/// 资源本身的格式，可采样的深度纹理需要无类型格式
pub fn resource_format(format: TextureFormat, usage: TextureUsage) -> DXGI_FORMAT {
    match format {
        TextureFormat::Depth24PlusStencil8 if usage.contains(TextureUsage::SAMPLED) => DXGI_FORMAT_R24G8_TYPELESS,
        TextureFormat::Depth32Float if usage.contains(TextureUsage::SAMPLED) => DXGI_FORMAT_R32_TYPELESS,
        other => texture_format(other),
    }
}

/// 着色器资源视图的格式
pub fn srv_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Depth24PlusStencil8 => DXGI_FORMAT_R24_UNORM_X8_TYPELESS,
        TextureFormat::Depth32Float => DXGI_FORMAT_R32_FLOAT,
        other => texture_format(other),
    }
}

pub fn resource_dimension(texture_type: TextureType) -> D3D12_RESOURCE_DIMENSION {
    match texture_type {
        TextureType::Texture1D => D3D12_RESOURCE_DIMENSION_TEXTURE1D,
        TextureType::Texture2D | TextureType::TextureCube => D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        TextureType::Texture3D => D3D12_RESOURCE_DIMENSION_TEXTURE3D,
    }
}

pub fn buffer_flags(usage: BufferUsage) -> D3D12_RESOURCE_FLAGS {
    if usage.contains(BufferUsage::STORAGE) {
        D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
    } else {
        D3D12_RESOURCE_FLAG_NONE
    }
}

pub fn texture_flags(usage: TextureUsage) -> D3D12_RESOURCE_FLAGS {
    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if usage.contains(TextureUsage::STORAGE) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        if !usage.contains(TextureUsage::SAMPLED) {
            flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
        }
    }
    flags
}

pub fn heap_type(memory_type: MemoryType) -> D3D12_HEAP_TYPE {
    match memory_type {
        MemoryType::DeviceLocal => D3D12_HEAP_TYPE_DEFAULT,
        MemoryType::Upload => D3D12_HEAP_TYPE_UPLOAD,
        MemoryType::Readback => D3D12_HEAP_TYPE_READBACK,
    }
}

/// 上传和回读堆要求固定的初始状态
pub fn initial_buffer_state(memory_type: MemoryType) -> D3D12_RESOURCE_STATES {
    match memory_type {
        MemoryType::DeviceLocal => D3D12_RESOURCE_STATE_COMMON,
        MemoryType::Upload => D3D12_RESOURCE_STATE_GENERIC_READ,
        MemoryType::Readback => D3D12_RESOURCE_STATE_COPY_DEST,
    }
}

pub fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    let table = [
        (ResourceState::VERTEX_AND_CONSTANT_BUFFER, D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER),
        (ResourceState::INDEX_BUFFER, D3D12_RESOURCE_STATE_INDEX_BUFFER),
        (ResourceState::RENDER_TARGET, D3D12_RESOURCE_STATE_RENDER_TARGET),
        (ResourceState::UNORDERED_ACCESS, D3D12_RESOURCE_STATE_UNORDERED_ACCESS),
        (ResourceState::DEPTH_WRITE, D3D12_RESOURCE_STATE_DEPTH_WRITE),
        (ResourceState::DEPTH_READ, D3D12_RESOURCE_STATE_DEPTH_READ),
        (ResourceState::NON_PIXEL_SHADER_RESOURCE, D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE),
        (ResourceState::PIXEL_SHADER_RESOURCE, D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE),
        (ResourceState::INDIRECT_ARGUMENT, D3D12_RESOURCE_STATE_INDIRECT_ARGUMENT),
        (ResourceState::COPY_DEST, D3D12_RESOURCE_STATE_COPY_DEST),
        (ResourceState::COPY_SOURCE, D3D12_RESOURCE_STATE_COPY_SOURCE),
        (ResourceState::PRESENT, D3D12_RESOURCE_STATE_PRESENT),
    ];
    table
        .iter()
        .filter(|(flag, _)| state.contains(*flag))
        .fold(D3D12_RESOURCE_STATE_COMMON, |acc, (_, native)| acc | *native)
}

pub fn command_list_type(queue_type: QueueType) -> D3D12_COMMAND_LIST_TYPE {
    match queue_type {
        QueueType::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueType::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        QueueType::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

pub fn sampler_desc(desc: &SamplerDescriptor) -> D3D12_SAMPLER_DESC {
    let filter = match (desc.filter, desc.max_anisotropy > 1) {
        (_, true) => D3D12_FILTER_ANISOTROPIC,
        (FilterMode::Nearest, false) => D3D12_FILTER_MIN_MAG_MIP_POINT,
        (FilterMode::Linear, false) => D3D12_FILTER_MIN_MAG_MIP_LINEAR,
    };
    let address = match desc.address_mode {
        AddressMode::Repeat => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressMode::MirrorRepeat => D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        AddressMode::ClampToEdge => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
    };
    D3D12_SAMPLER_DESC {
        Filter: filter,
        AddressU: address,
        AddressV: address,
        AddressW: address,
        MipLODBias: 0.0,
        MaxAnisotropy: desc.max_anisotropy.clamp(1, 16),
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        BorderColor: [0.0; 4],
        MinLOD: 0.0,
        MaxLOD: desc.max_lod,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_read_maps_to_native_generic_read() {
        assert_eq!(resource_state(ResourceState::GENERIC_READ), D3D12_RESOURCE_STATE_GENERIC_READ);
        assert_eq!(resource_state(ResourceState::COMMON), D3D12_RESOURCE_STATE_COMMON);
    }

    #[test]
    fn test_cube_is_two_dimensional_resource() {
        assert_eq!(resource_dimension(TextureType::TextureCube), D3D12_RESOURCE_DIMENSION_TEXTURE2D);
        assert_eq!(resource_dimension(TextureType::Texture3D), D3D12_RESOURCE_DIMENSION_TEXTURE3D);
    }

    #[test]
    fn test_sampled_depth_uses_typeless_format() {
        let usage = TextureUsage::DEPTH_STENCIL | TextureUsage::SAMPLED;
        assert_eq!(resource_format(TextureFormat::Depth32Float, usage), DXGI_FORMAT_R32_TYPELESS);
        assert_eq!(
            resource_format(TextureFormat::Depth32Float, TextureUsage::DEPTH_STENCIL),
            DXGI_FORMAT_D32_FLOAT
        );
    }
}
