//! 渲染硬件接口核心
//!
//! 本模块提供与具体图形 API 无关的 RHI 核心，应用程序通过 [`Device`]
//! 创建资源、录制命令并推进帧循环，而不需要关心底层使用的是哪个后端。
//!
//! # 架构设计
//!
//! - `handle`：带代数的句柄池，过期句柄在访问时被拒绝
//! - `descriptor`：持久区 + 环形临时区的描述符堆
//! - `deletion`：按帧延迟销毁
//! - `state`：资源状态追踪与屏障生成
//! - `ring` / `ring_buffer`：上传用的环形分配器
//! - `sync` / `command`：栅栏、队列与命令上下文
//! - `device`：把以上组件组合在一起
//!
//! 具体后端实现在 `gfx` 模块中，通过 [`RenderBackend`] trait 接入。

pub mod handle;
pub mod sync;
pub mod ring;
pub mod ring_buffer;
pub mod deletion;
pub mod descriptor;
pub mod state;
pub mod resource;
pub mod backend_trait;
pub mod command;
pub mod device;

pub use backend_trait::RenderBackend;
pub use command::{CommandContext, CommandQueue, QueueType, ResourceHandle};
pub use deletion::DeferredDeletionQueue;
pub use descriptor::{DescriptorHandle, DescriptorHeapType, DescriptorManager};
pub use device::{Device, DeviceStats};
pub use handle::{Handle, Pool};
pub use resource::{
    BindGroup, BindGroupEntry, BindingLayout, BufferDescriptor, BufferHandle, BufferUsage, MemoryType,
    PipelineHandle, SamplerDescriptor, ShaderDescriptor, ShaderHandle, TextureDescriptor, TextureFormat,
    TextureHandle, TextureUsage,
};
pub use ring_buffer::RingBufferAllocator;
pub use state::{GlobalResourceStates, ResourceState, ResourceStateTracker, Subresource};
pub use sync::{FenceValue, GpuFence, SyncPoint};
