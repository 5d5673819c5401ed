//! 图形后端模块
//!
//! 本模块封装了不同图形 API 的底层实现，包括：
//! - Null：不依赖 GPU 的软件后端，命令在提交时于 CPU 上执行
//! - Vulkan：跨平台的现代图形 API（`vulkan` 特性）
//! - DirectX 12：Windows 平台的高性能图形 API
//!
//! 所有后端都实现了统一的 `RenderBackend` trait，上层的 `Device<B>`
//! 对后端泛型；[`BackendDevice`] 在运行时按配置选择其中之一。

use tracing::info;

use crate::core::config::BackendKind;
use crate::core::error::{BackendApi, ConfigError, Result};
use crate::core::Config;
use crate::renderer::backend_trait::RenderBackend;
use crate::renderer::device::Device;

pub mod null;
#[cfg(feature = "vulkan")]
pub mod vulkan;
#[cfg(target_os = "windows")]
pub mod dx12;

pub use null::NullBackend;
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanBackend;
#[cfg(target_os = "windows")]
pub use dx12::Dx12Backend;

/// 对任意后端的设备执行的操作
///
/// `Device<B>` 对后端泛型，运行时选择的设备通过访问者把具体类型交还给调用方。
pub trait DeviceVisitor {
    type Output;

    fn visit<B: RenderBackend>(self, device: &mut Device<B>) -> Self::Output;
}

/// 运行时选择的设备
///
/// 通过枚举分发避免把整个设备装箱成 trait 对象。
pub enum BackendDevice {
    Null(Device<NullBackend>),
    #[cfg(feature = "vulkan")]
    Vulkan(Device<VulkanBackend>),
    #[cfg(target_os = "windows")]
    Dx12(Device<Dx12Backend>),
}

impl BackendDevice {
    pub fn api(&self) -> BackendApi {
        match self {
            BackendDevice::Null(d) => d.backend().api(),
            #[cfg(feature = "vulkan")]
            BackendDevice::Vulkan(d) => d.backend().api(),
            #[cfg(target_os = "windows")]
            BackendDevice::Dx12(d) => d.backend().api(),
        }
    }

    pub fn adapter_name(&self) -> &str {
        match self {
            BackendDevice::Null(d) => d.backend().adapter_name(),
            #[cfg(feature = "vulkan")]
            BackendDevice::Vulkan(d) => d.backend().adapter_name(),
            #[cfg(target_os = "windows")]
            BackendDevice::Dx12(d) => d.backend().adapter_name(),
        }
    }

    pub fn visit<V: DeviceVisitor>(&mut self, visitor: V) -> V::Output {
        match self {
            BackendDevice::Null(d) => visitor.visit(d),
            #[cfg(feature = "vulkan")]
            BackendDevice::Vulkan(d) => visitor.visit(d),
            #[cfg(target_os = "windows")]
            BackendDevice::Dx12(d) => visitor.visit(d),
        }
    }

    /// 等待 GPU 空闲、回收所有延迟删除的对象并检查泄漏
    pub fn shutdown(self) -> Result<()> {
        match self {
            BackendDevice::Null(d) => d.shutdown(),
            #[cfg(feature = "vulkan")]
            BackendDevice::Vulkan(d) => d.shutdown(),
            #[cfg(target_os = "windows")]
            BackendDevice::Dx12(d) => d.shutdown(),
        }
    }
}

/// 按配置创建设备
pub fn create_device(config: &Config) -> Result<BackendDevice> {
    let backend = config.device.backend;
    info!(backend = backend.name(), "Initializing {} Backend", backend.name());

    match backend {
        BackendKind::Null => Ok(BackendDevice::Null(Device::new(NullBackend::new(), config)?)),
        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => {
            let raw = VulkanBackend::new(config.device.debug_layer)?;
            Ok(BackendDevice::Vulkan(Device::new(raw, config)?))
        }
        #[cfg(not(feature = "vulkan"))]
        BackendKind::Vulkan => Err(unavailable(backend, "the crate was built without the `vulkan` feature")),
        #[cfg(target_os = "windows")]
        BackendKind::Dx12 => {
            let raw = Dx12Backend::new(config.device.debug_layer)?;
            Ok(BackendDevice::Dx12(Device::new(raw, config)?))
        }
        #[cfg(not(target_os = "windows"))]
        BackendKind::Dx12 => Err(unavailable(backend, "DX12 backend is only available on Windows")),
    }
}

#[allow(dead_code)]
fn unavailable(backend: BackendKind, reason: &str) -> crate::core::error::RhiError {
    ConfigError::InvalidValue {
        field: "device.backend".to_string(),
        reason: format!("{}: {reason}", backend.name()),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_null_device() {
        let mut config = Config::default();
        config.device.backend = BackendKind::Null;

        let device = create_device(&config).unwrap();
        assert_eq!(device.api(), BackendApi::Null);
        assert!(!device.adapter_name().is_empty());
        device.shutdown().unwrap();
    }

    struct FrameCount;

    impl DeviceVisitor for FrameCount {
        type Output = Result<u64>;

        fn visit<B: RenderBackend>(self, device: &mut Device<B>) -> Self::Output {
            device.begin_frame()?;
            device.end_frame()?;
            Ok(device.frame_index())
        }
    }

    #[test]
    fn test_visitor_runs_against_concrete_device() {
        let mut config = Config::default();
        config.device.backend = BackendKind::Null;

        let mut device = create_device(&config).unwrap();
        assert_eq!(device.visit(FrameCount).unwrap(), 1);
        device.shutdown().unwrap();
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn test_dx12_unavailable_off_windows() {
        let mut config = Config::default();
        config.device.backend = BackendKind::Dx12;
        assert!(matches!(create_device(&config), Err(crate::core::error::RhiError::Config(_))));
    }
}
