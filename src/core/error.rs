//! 错误处理模块
//!
//! 定义了 RHI 中使用的统一错误类型，使用 `thiserror` 提供友好的错误消息。
//!
//! # 错误分类
//!
//! - **契约违规**：过期句柄删除、重复释放、非法队列状态转换、关闭时仍有存活句柄。
//!   Debug 构建中断言，Release 构建记录日志后继续（见 [`crate::core::contract`]）。
//! - **资源耗尽**：描述符堆已满、句柄索引空间用尽。表示静态容量配置过小，不重试。
//! - **背压**：环形缓冲区暂时满。不是错误，阻塞等待栅栏后重试，并记录警告。
//! - **后端错误**：Vulkan / D3D12 调用失败，统一转换为 [`BackendError`]，携带后端的错误字符串。

use thiserror::Error;

/// RHI 统一的 Result 类型
pub type Result<T> = std::result::Result<T, RhiError>;

/// RHI 的错误类型
#[derive(Debug, Error)]
pub enum RhiError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 图形 API 调用失败
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// 句柄池的 16 位索引空间已用尽
    #[error("Pool '{pool}' exhausted its index space ({capacity} slots)")]
    PoolExhausted { pool: &'static str, capacity: usize },

    /// 描述符堆容量耗尽
    #[error("Descriptor heap {heap} exhausted in {region} region (capacity {capacity}, requested {requested})")]
    DescriptorHeapExhausted {
        heap: &'static str,
        region: &'static str,
        capacity: u32,
        requested: u32,
    },

    /// 分配大小超过环形缓冲区总容量
    #[error("Ring buffer allocation of {requested} bytes exceeds capacity of {capacity} bytes")]
    AllocationTooLarge { requested: u64, capacity: u64 },

    /// 环形缓冲区已满，且没有可以等待的已提交区域
    #[error("Ring buffer exhausted: {requested} bytes requested, every region is still owned by unsubmitted work")]
    RingBufferExhausted { requested: u64 },

    /// 句柄无效或已过期
    #[error("Invalid {kind} handle: {handle}")]
    InvalidHandle { kind: &'static str, handle: String },

    /// 栅栏等待超时，视为设备丢失
    #[error("Device lost: waiting for fence value {value} timed out after {timeout_ms} ms")]
    DeviceLost { value: u64, timeout_ms: u64 },

    /// 命令录制状态错误
    #[error("Command recording error: {0}")]
    CommandRecording(String),

    /// 关闭时仍有存活的资源
    #[error("Resource leak at shutdown: {0}")]
    ResourceLeak(String),

    /// 契约违规（Release 构建下由调用方决定是否致命）
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 日志系统错误
    #[error("Log error: {0}")]
    Log(String),
}

/// 配置相关的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 后端 API 标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendApi {
    Null,
    Vulkan,
    Dx12,
}

impl std::fmt::Display for BackendApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendApi::Null => "Null",
            BackendApi::Vulkan => "Vulkan",
            BackendApi::Dx12 => "D3D12",
        };
        f.write_str(name)
    }
}

/// 后端 API 调用失败
///
/// 所有后端的失败码都转换成这一个类型，`message` 保留后端原始的错误描述。
#[derive(Debug, Clone, Error)]
#[error("{api} call `{call}` failed: {message}")]
pub struct BackendError {
    pub api: BackendApi,
    pub call: &'static str,
    pub message: String,
}

impl BackendError {
    pub fn new(api: BackendApi, call: &'static str, message: impl Into<String>) -> Self {
        Self {
            api,
            call,
            message: message.into(),
        }
    }
}

impl RhiError {
    /// 快捷构造后端错误
    pub fn backend(api: BackendApi, call: &'static str, message: impl ToString) -> Self {
        RhiError::Backend(BackendError::new(api, call, message.to_string()))
    }

    /// 是否为设备丢失（无法恢复）
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RhiError::DeviceLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RhiError::DescriptorHeapExhausted {
            heap: "CBV_SRV_UAV",
            region: "persistent",
            capacity: 16,
            requested: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("CBV_SRV_UAV"));
        assert!(msg.contains("persistent"));
    }

    #[test]
    fn test_backend_error_carries_message() {
        let err = RhiError::backend(BackendApi::Vulkan, "vkCreateBuffer", "ERROR_OUT_OF_DEVICE_MEMORY");
        assert_eq!(
            err.to_string(),
            "Backend error: Vulkan call `vkCreateBuffer` failed: ERROR_OUT_OF_DEVICE_MEMORY"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let err: RhiError = ConfigError::InvalidValue {
            field: "device.buffered_frames".into(),
            reason: "must be at least 1".into(),
        }
        .into();
        assert!(matches!(err, RhiError::Config(_)));
        assert!(!err.is_device_lost());
    }
}
