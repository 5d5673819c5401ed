//! DirectX 12 图形 API 实现模块
//!
//! 本模块包含了所有 DirectX 12 相关的代码，包括：
//! - Context: 调试层、DXGI 工厂、适配器和 D3D12 设备，以及栅栏
//! - Backend: `RenderBackend` 的 D3D12 实现
//! - Descriptor: 原生描述符堆与视图写入
//! - Conv: 通用类型到 D3D12 类型的转换

pub mod backend;
pub mod context;
pub mod conv;
pub mod descriptor;

// 重新导出常用类型
pub use backend::Dx12Backend;
pub use context::{Dx12Context, Dx12Fence};
pub use descriptor::Dx12DescriptorHeap;
