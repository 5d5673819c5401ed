//! Vulkan 描述符堆
//!
//! Vulkan 没有描述符堆对象，这里用一个大的无绑定描述符集合来模拟：
//!
//! - CBV/SRV/UAV 堆：binding 0 为存储缓冲区数组，binding 1 为采样图像数组，
//!   binding 2 为存储图像数组，三者共享同一套槽位下标
//! - 采样器堆：binding 0 为采样器数组，槽位持有 `vk::Sampler`
//! - RTV/DSV 堆：只在 CPU 侧记录图像视图

use ash::vk;

use super::context::vk_error;
use crate::core::error::Result;
use crate::renderer::descriptor::{DescriptorHeapDescriptor, DescriptorHeapType};
use crate::renderer::resource::{AddressMode, FilterMode, SamplerDescriptor};

pub const STORAGE_BUFFER_BINDING: u32 = 0;
pub const SAMPLED_IMAGE_BINDING: u32 = 1;
pub const STORAGE_IMAGE_BINDING: u32 = 2;
pub const SAMPLER_BINDING: u32 = 0;

/// 无绑定集合
pub struct BindlessSet {
    pub pool: vk::DescriptorPool,
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
}

pub enum HeapStorage {
    Bindless(BindlessSet),
    /// RTV / DSV，视图归纹理所有
    Views(Vec<vk::ImageView>),
}

pub struct VulkanDescriptorHeap {
    pub heap_type: DescriptorHeapType,
    pub capacity: u32,
    pub storage: HeapStorage,
    /// 采样器堆中每个槽位持有的采样器
    pub samplers: Vec<vk::Sampler>,
}

impl VulkanDescriptorHeap {
    pub fn create(device: &ash::Device, desc: &DescriptorHeapDescriptor) -> Result<Self> {
        let capacity = desc.capacity.total();
        let storage = match desc.heap_type {
            DescriptorHeapType::CbvSrvUav => HeapStorage::Bindless(create_bindless_set(
                device,
                &[
                    (STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER),
                    (SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE),
                    (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
                ],
                capacity,
            )?),
            DescriptorHeapType::Sampler => HeapStorage::Bindless(create_bindless_set(
                device,
                &[(SAMPLER_BINDING, vk::DescriptorType::SAMPLER)],
                capacity,
            )?),
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => {
                HeapStorage::Views(vec![vk::ImageView::null(); capacity as usize])
            }
        };

        let samplers = match desc.heap_type {
            DescriptorHeapType::Sampler => vec![vk::Sampler::null(); capacity as usize],
            _ => Vec::new(),
        };

        Ok(Self {
            heap_type: desc.heap_type,
            capacity,
            storage,
            samplers,
        })
    }

    pub fn bindless(&self) -> Option<&BindlessSet> {
        match &self.storage {
            HeapStorage::Bindless(set) => Some(set),
            HeapStorage::Views(_) => None,
        }
    }

    /// 记录 RTV / DSV 槽位对应的图像视图
    pub fn set_view(&mut self, index: u32, view: vk::ImageView) {
        if let HeapStorage::Views(views) = &mut self.storage {
            if let Some(slot) = views.get_mut(index as usize) {
                *slot = view;
            }
        }
    }

    /// 替换采样器槽位，返回旧的采样器
    pub fn replace_sampler(&mut self, index: u32, sampler: vk::Sampler) -> Option<vk::Sampler> {
        let slot = self.samplers.get_mut(index as usize)?;
        let old = std::mem::replace(slot, sampler);
        (old != vk::Sampler::null()).then_some(old)
    }

    pub fn destroy(self, device: &ash::Device) {
        // SAFETY: 调用方保证 GPU 不再使用该堆
        unsafe {
            for sampler in self.samplers {
                if sampler != vk::Sampler::null() {
                    device.destroy_sampler(sampler, None);
                }
            }
            if let HeapStorage::Bindless(set) = self.storage {
                device.destroy_descriptor_pool(set.pool, None);
                device.destroy_descriptor_set_layout(set.layout, None);
            }
        }
    }
}

fn create_bindless_set(
    device: &ash::Device,
    bindings: &[(u32, vk::DescriptorType)],
    capacity: u32,
) -> Result<BindlessSet> {
    // 描述符池的数量必须大于 0
    let count = capacity.max(1);

    let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .map(|&(binding, ty)| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build()
        })
        .collect();
    let binding_flags = vec![
        vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        bindings.len()
    ];
    let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(&layout_bindings)
        .push_next(&mut flags_info);

    // SAFETY: create info 引用的数据在调用期间有效
    let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
        .map_err(|e| vk_error("vkCreateDescriptorSetLayout", e))?;

    let pool_sizes: Vec<vk::DescriptorPoolSize> = bindings
        .iter()
        .map(|&(_, ty)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        })
        .collect();
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
        .max_sets(1)
        .pool_sizes(&pool_sizes);

    // SAFETY: 同上
    let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
        Ok(pool) => pool,
        Err(e) => {
            unsafe { device.destroy_descriptor_set_layout(layout, None) };
            return Err(vk_error("vkCreateDescriptorPool", e));
        }
    };

    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    // SAFETY: 池中只分配这一个集合
    match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(sets) => Ok(BindlessSet {
            pool,
            layout,
            set: sets[0],
        }),
        Err(e) => {
            unsafe {
                device.destroy_descriptor_pool(pool, None);
                device.destroy_descriptor_set_layout(layout, None);
            }
            Err(vk_error("vkAllocateDescriptorSets", e))
        }
    }
}

/// 按采样器描述创建原生采样器
pub fn create_sampler(device: &ash::Device, desc: &SamplerDescriptor, anisotropy: bool) -> Result<vk::Sampler> {
    let filter = match desc.filter {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    };
    let mipmap_mode = match desc.filter {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    };
    let address = match desc.address_mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    };

    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(address)
        .address_mode_v(address)
        .address_mode_w(address)
        .anisotropy_enable(anisotropy && desc.max_anisotropy > 1)
        .max_anisotropy(desc.max_anisotropy as f32)
        .min_lod(0.0)
        .max_lod(desc.max_lod);

    // SAFETY: create info 在调用期间有效
    unsafe { device.create_sampler(&info, None) }.map_err(|e| vk_error("vkCreateSampler", e))
}
