//! DistRHI - 多后端渲染硬件接口
//!
//! 基于句柄的 RHI 核心，支持 Vulkan 和 DirectX 12，并带有一个不依赖 GPU 的
//! Null 后端用于测试。资源由带代数的句柄引用，销毁按帧延迟，状态屏障
//! 在录制时自动生成。
//!
//! # 模块结构
//!
//! - `core`: 核心功能模块（日志、配置、错误处理、契约检查）
//! - `renderer`: 与 API 无关的 RHI 核心（句柄池、描述符堆、状态追踪、命令上下文）
//! - `gfx`: 图形后端实现（Null、Vulkan、DX12）
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_rhi::core::config::{BackendKind, Config};
//! use dist_rhi::gfx::NullBackend;
//! use dist_rhi::renderer::{BufferDescriptor, Device};
//!
//! let mut config = Config::default();
//! config.device.backend = BackendKind::Null;
//!
//! let mut device = Device::new(NullBackend::new(), &config)?;
//! let buffer = device.create_buffer(&BufferDescriptor::uniform(256))?;
//!
//! device.begin_frame()?;
//! device.destroy_buffer(buffer);
//! device.end_frame()?;
//!
//! device.shutdown()?;
//! # Ok::<(), dist_rhi::core::RhiError>(())
//! ```

pub mod core;
pub mod renderer;
pub mod gfx;
