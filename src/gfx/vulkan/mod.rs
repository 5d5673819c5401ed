//! Vulkan 图形 API 实现模块
//!
//! 本模块包含了所有 Vulkan 相关的代码，包括：
//! - Context: 实例、物理设备、逻辑设备和队列族
//! - Backend: `RenderBackend` 的 ash 实现
//! - Descriptor: 用无绑定描述符集合模拟描述符堆
//! - Conv: 通用类型到 Vulkan 类型的转换

pub mod backend;
pub mod context;
pub mod conv;
pub mod descriptor;

// 重新导出常用类型
pub use backend::{VulkanBackend, VulkanFence};
pub use context::{QueueFamilies, VulkanContext};
pub use descriptor::VulkanDescriptorHeap;
