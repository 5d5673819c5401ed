//! 通用类型到 Vulkan 类型的转换

use ash::vk;

use crate::renderer::command::QueueType;
use crate::renderer::resource::{BufferUsage, TextureFormat, TextureType, TextureUsage};
use crate::renderer::state::ResourceState;

pub fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn image_type(texture_type: TextureType) -> vk::ImageType {
    match texture_type {
        TextureType::Texture1D => vk::ImageType::TYPE_1D,
        TextureType::Texture2D | TextureType::TextureCube => vk::ImageType::TYPE_2D,
        TextureType::Texture3D => vk::ImageType::TYPE_3D,
    }
}

pub fn image_view_type(texture_type: TextureType, array_layers: u32) -> vk::ImageViewType {
    match texture_type {
        TextureType::Texture1D if array_layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
        TextureType::Texture1D => vk::ImageViewType::TYPE_1D,
        TextureType::Texture2D if array_layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureType::Texture2D => vk::ImageViewType::TYPE_2D,
        TextureType::Texture3D => vk::ImageViewType::TYPE_3D,
        TextureType::TextureCube if array_layers > 6 => vk::ImageViewType::CUBE_ARRAY,
        TextureType::TextureCube => vk::ImageViewType::CUBE,
    }
}

/// 所有缓冲区都可作为存储缓冲区绑定，常量缓冲区也走无绑定的 binding 0
pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.intersects(BufferUsage::UNIFORM | BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    flags
}

pub fn image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    flags
}

/// 资源状态对应的管线阶段和访问类型
///
/// 图像始终处于 GENERAL 布局，状态只影响同步范围。
pub fn state_scope(state: ResourceState) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let shader_stages = vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::COMPUTE_SHADER;

    if state.is_empty() {
        return (vk::PipelineStageFlags::ALL_COMMANDS, vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
    }

    let table = [
        (
            ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            vk::PipelineStageFlags::VERTEX_INPUT | shader_stages,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::SHADER_READ,
        ),
        (
            ResourceState::INDEX_BUFFER,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::INDEX_READ,
        ),
        (
            ResourceState::RENDER_TARGET,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        (
            ResourceState::UNORDERED_ACCESS,
            shader_stages,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        ),
        (
            ResourceState::DEPTH_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (
            ResourceState::DEPTH_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ),
        (
            ResourceState::NON_PIXEL_SHADER_RESOURCE,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        (
            ResourceState::PIXEL_SHADER_RESOURCE,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        (
            ResourceState::INDIRECT_ARGUMENT,
            vk::PipelineStageFlags::DRAW_INDIRECT,
            vk::AccessFlags::INDIRECT_COMMAND_READ,
        ),
        (
            ResourceState::COPY_DEST,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        ),
        (
            ResourceState::COPY_SOURCE,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
        (
            ResourceState::PRESENT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
    ];

    table
        .iter()
        .filter(|(flag, ..)| state.contains(*flag))
        .fold((vk::PipelineStageFlags::empty(), vk::AccessFlags::empty()), |(stages, access), (_, s, a)| {
            (stages | *s, access | *a)
        })
}

/// 队列族支持的管线阶段
pub fn supported_stages(queue_type: QueueType) -> vk::PipelineStageFlags {
    let common = vk::PipelineStageFlags::TOP_OF_PIPE
        | vk::PipelineStageFlags::BOTTOM_OF_PIPE
        | vk::PipelineStageFlags::ALL_COMMANDS
        | vk::PipelineStageFlags::TRANSFER;
    match queue_type {
        QueueType::Direct => vk::PipelineStageFlags::from_raw(!0),
        QueueType::Compute => {
            common | vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::DRAW_INDIRECT
        }
        QueueType::Copy => common,
    }
}

/// 队列族支持的访问类型
pub fn supported_access(queue_type: QueueType) -> vk::AccessFlags {
    let common = vk::AccessFlags::TRANSFER_READ
        | vk::AccessFlags::TRANSFER_WRITE
        | vk::AccessFlags::MEMORY_READ
        | vk::AccessFlags::MEMORY_WRITE;
    match queue_type {
        QueueType::Direct => vk::AccessFlags::from_raw(!0),
        QueueType::Compute => {
            common
                | vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::INDIRECT_COMMAND_READ
        }
        QueueType::Copy => common,
    }
}

/// 把阶段裁剪到队列支持的范围，空集合退化为 `fallback`
pub fn mask_stages(
    stages: vk::PipelineStageFlags,
    queue_type: QueueType,
    fallback: vk::PipelineStageFlags,
) -> vk::PipelineStageFlags {
    let masked = stages & supported_stages(queue_type);
    if masked.is_empty() {
        fallback
    } else {
        masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_states_map_to_transfer() {
        let (stage, access) = state_scope(ResourceState::COPY_DEST);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);

        let (stage, access) = state_scope(ResourceState::COPY_SOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE);
        assert!(stage.contains(vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER));
        assert!(access.contains(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::SHADER_READ));
    }

    #[test]
    fn test_copy_queue_masks_shader_stages() {
        let (stage, _) = state_scope(ResourceState::UNORDERED_ACCESS);
        let masked = mask_stages(stage, QueueType::Copy, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masked, vk::PipelineStageFlags::TOP_OF_PIPE);

        let masked = mask_stages(stage, QueueType::Compute, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masked, vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn test_cube_view_types() {
        assert_eq!(image_type(TextureType::TextureCube), vk::ImageType::TYPE_2D);
        assert_eq!(image_view_type(TextureType::TextureCube, 6), vk::ImageViewType::CUBE);
        assert_eq!(image_view_type(TextureType::TextureCube, 12), vk::ImageViewType::CUBE_ARRAY);
        assert_eq!(image_view_type(TextureType::Texture2D, 6), vk::ImageViewType::TYPE_2D_ARRAY);
    }

    #[test]
    fn test_depth_stencil_aspect() {
        assert_eq!(
            aspect_mask(TextureFormat::Depth24PlusStencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_mask(TextureFormat::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    }
}
