//! Vulkan 上下文
//!
//! 创建无窗口的 Vulkan 1.2 实例和逻辑设备，选择队列族，并开启
//! 时间线信号量与描述符索引（无绑定描述符堆依赖它们）。

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use ash::vk;
use tracing::{debug, info, warn};

use crate::core::error::{BackendApi, Result, RhiError};
use crate::renderer::command::QueueType;

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";
const QUEUE_PRIORITIES: [f32; 1] = [1.0];

pub(crate) fn vk_error(call: &'static str, result: vk::Result) -> RhiError {
    RhiError::backend(BackendApi::Vulkan, call, result)
}

/// 三类队列各自使用的队列族
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub direct: u32,
    pub compute: u32,
    pub copy: u32,
}

impl QueueFamilies {
    pub fn family(&self, queue_type: QueueType) -> u32 {
        match queue_type {
            QueueType::Direct => self.direct,
            QueueType::Compute => self.compute,
            QueueType::Copy => self.copy,
        }
    }

    /// 去重后的队列族，用于并发共享模式
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.direct, self.compute, self.copy];
        families.sort_unstable();
        families.dedup();
        families
    }

    /// 优先选择专用的计算族和拷贝族，没有时退回直接队列族
    fn select(properties: &[vk::QueueFamilyProperties]) -> Option<Self> {
        let find = |required: vk::QueueFlags, excluded: vk::QueueFlags| {
            properties
                .iter()
                .position(|p| p.queue_count > 0 && p.queue_flags.contains(required) && !p.queue_flags.intersects(excluded))
                .map(|i| i as u32)
        };

        let direct = find(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, vk::QueueFlags::empty())?;
        let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(direct);
        let copy = find(vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            .unwrap_or(compute);
        Some(Self { direct, compute, copy })
    }
}

/// Vulkan 实例、物理设备和逻辑设备
///
/// 以 `Arc` 共享，栅栏持有引用，最后一个引用释放时销毁设备和实例。
pub struct VulkanContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub adapter_name: String,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub families: QueueFamilies,
    pub queues: [vk::Queue; 3],
    /// 是否开启了各向异性过滤
    pub sampler_anisotropy: bool,
}

impl VulkanContext {
    pub fn new(debug_layer: bool) -> Result<Self> {
        // SAFETY: 加载系统的 Vulkan 加载器
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RhiError::backend(BackendApi::Vulkan, "vkGetInstanceProcAddr", e))?;

        let instance = create_instance(&entry, debug_layer)?;
        match Self::with_instance(entry, instance) {
            Ok(context) => Ok(context),
            Err((instance, err)) => {
                // SAFETY: 设备创建失败，实例没有任何子对象
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    fn with_instance(entry: ash::Entry, instance: ash::Instance) -> std::result::Result<Self, (ash::Instance, RhiError)> {
        let (physical_device, families, adapter_name) = match pick_physical_device(&instance) {
            Ok(picked) => picked,
            Err(err) => return Err((instance, err)),
        };

        // SAFETY: 物理设备来自该实例
        let sampler_anisotropy =
            unsafe { instance.get_physical_device_features(physical_device) }.sampler_anisotropy == vk::TRUE;

        let device = match create_device(&instance, physical_device, &families, sampler_anisotropy) {
            Ok(device) => device,
            Err(err) => return Err((instance, err)),
        };

        // SAFETY: 队列族和索引都在创建设备时请求过
        let queues = unsafe {
            [
                device.get_device_queue(families.direct, 0),
                device.get_device_queue(families.compute, 0),
                device.get_device_queue(families.copy, 0),
            ]
        };
        // SAFETY: 物理设备来自该实例
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        info!(
            adapter = %adapter_name,
            direct = families.direct,
            compute = families.compute,
            copy = families.copy,
            "Vulkan device created"
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            adapter_name,
            memory_properties,
            families,
            queues,
            sampler_anisotropy,
        })
    }

    pub fn queue(&self, queue_type: QueueType) -> vk::Queue {
        self.queues[queue_type.index()]
    }

    /// 查找满足类型位和属性的内存类型
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        let props = &self.memory_properties;
        (0..props.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
        })
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        // SAFETY: 最后一个引用释放时所有子对象都已销毁
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                warn!(error = %err, "vkDeviceWaitIdle failed during teardown");
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        debug!(adapter = %self.adapter_name, "Vulkan device destroyed");
    }
}

fn create_instance(entry: &ash::Entry, debug_layer: bool) -> Result<ash::Instance> {
    let app_name = CString::new("dist_rhi").map_err(|e| RhiError::backend(BackendApi::Vulkan, "CString", e))?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&app_name)
        .api_version(vk::API_VERSION_1_2);

    let mut layers: Vec<*const c_char> = Vec::new();
    if debug_layer {
        let available = entry
            .enumerate_instance_layer_properties()
            .map_err(|e| vk_error("vkEnumerateInstanceLayerProperties", e))?;
        // SAFETY: 常量以 NUL 结尾
        let wanted = unsafe { CStr::from_bytes_with_nul_unchecked(VALIDATION_LAYER) };
        let found = available.iter().any(|layer| {
            // SAFETY: layer_name 是驱动填写的以 NUL 结尾的字符串
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == wanted
        });
        if found {
            layers.push(wanted.as_ptr());
            debug!("Vulkan validation layer enabled");
        } else {
            warn!("Vulkan validation layer requested but not installed");
        }
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_layer_names(&layers);

    // SAFETY: create_info 引用的数据在调用期间有效
    unsafe { entry.create_instance(&create_info, None) }.map_err(|e| vk_error("vkCreateInstance", e))
}

fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, QueueFamilies, String)> {
    // SAFETY: 实例有效
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| vk_error("vkEnumeratePhysicalDevices", e))?;

    let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies, String)> = None;
    for physical in devices {
        // SAFETY: 物理设备来自该实例
        let (props, families, features_ok) = unsafe {
            let props = instance.get_physical_device_properties(physical);
            let families = QueueFamilies::select(&instance.get_physical_device_queue_family_properties(physical));

            let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features12);
            instance.get_physical_device_features2(physical, &mut features2);
            let ok = features12.timeline_semaphore == vk::TRUE
                && features12.descriptor_indexing == vk::TRUE
                && features12.descriptor_binding_partially_bound == vk::TRUE
                && features12.runtime_descriptor_array == vk::TRUE
                && features12.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE
                && features12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
                && features12.descriptor_binding_storage_image_update_after_bind == vk::TRUE;
            (props, families, ok)
        };
        // SAFETY: device_name 是驱动填写的以 NUL 结尾的字符串
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if vk::api_version_minor(props.api_version) < 2 && vk::api_version_major(props.api_version) == 1 {
            debug!(adapter = %name, "Skipping adapter without Vulkan 1.2");
            continue;
        }
        let Some(families) = families else {
            debug!(adapter = %name, "Skipping adapter without a graphics+compute queue");
            continue;
        };
        if !features_ok {
            debug!(adapter = %name, "Skipping adapter without timeline semaphores or descriptor indexing");
            continue;
        }

        let score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        };
        if best.as_ref().map_or(true, |(s, ..)| score > *s) {
            best = Some((score, physical, families, name));
        }
    }

    best.map(|(_, physical, families, name)| (physical, families, name))
        .ok_or_else(|| RhiError::backend(BackendApi::Vulkan, "vkEnumeratePhysicalDevices", "no suitable adapter"))
}

fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
    sampler_anisotropy: bool,
) -> Result<ash::Device> {
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&QUEUE_PRIORITIES)
                .build()
        })
        .collect();

    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(true)
        .descriptor_indexing(true)
        .descriptor_binding_partially_bound(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .shader_storage_buffer_array_non_uniform_indexing(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_image_array_non_uniform_indexing(true);

    let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(sampler_anisotropy);
    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_features(&features)
        .push_next(&mut features12);

    // SAFETY: create_info 引用的数据在调用期间有效
    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| vk_error("vkCreateDevice", e))
}
