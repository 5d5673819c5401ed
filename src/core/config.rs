//! 配置管理模块
//!
//! 提供 RHI 配置的加载、解析和校验。所有容量都是构造期常量：
//! 描述符堆在运行时不扩容，句柄池只在初始容量不足时按 1.5 倍增长。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [device]
//! backend = "vulkan"        # null, vulkan 或 dx12
//! buffered_frames = 3       # 同时也是延迟删除的帧数
//! fence_timeout_ms = 5000   # 可选，超时视为设备丢失
//! debug_layer = true
//!
//! [descriptors.cbv_srv_uav]
//! persistent = 4096
//! temporary = 4096
//!
//! [upload]
//! ring_buffer_size = 16777216
//! alignment = 256
//!
//! [pools]
//! buffers = 256
//! textures = 256
//!
//! [logging]
//! level = "info"            # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};

/// D3D12 着色器可见 CBV/SRV/UAV 堆（Tier 1）的描述符上限
pub const MAX_SHADER_VISIBLE_DESCRIPTORS: u32 = 1_000_000;

/// 着色器可见采样器堆的描述符上限
pub const MAX_SHADER_VISIBLE_SAMPLERS: u32 = 2048;

/// RHI 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 设备配置
    #[serde(default)]
    pub device: DeviceConfig,

    /// 各类描述符堆的容量
    #[serde(default)]
    pub descriptors: DescriptorConfig,

    /// 上传环形缓冲区配置
    #[serde(default)]
    pub upload: UploadConfig,

    /// 句柄池初始容量
    #[serde(default)]
    pub pools: PoolConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 图形后端选择
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// CPU 允许领先 GPU 的帧数
    #[serde(default = "default_buffered_frames")]
    pub buffered_frames: u32,

    /// 栅栏等待超时（毫秒），`None` 表示无限等待
    #[serde(default)]
    pub fence_timeout_ms: Option<u64>,

    /// 每个队列最多缓存的命令列表数量
    #[serde(default = "default_command_lists_per_queue")]
    pub command_lists_per_queue: u32,

    /// 是否启用 API 调试层
    #[serde(default = "default_debug_layer")]
    pub debug_layer: bool,
}

/// 图形后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 无 GPU 的软件后端
    Null,
    /// Vulkan 后端
    Vulkan,
    /// DirectX 12 后端
    Dx12,
}

/// 单个描述符堆的容量划分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapCapacity {
    /// 持久区容量（纹理 / 缓冲区视图）
    pub persistent: u32,
    /// 临时区容量（每帧的内联描述符表）
    #[serde(default)]
    pub temporary: u32,
}

impl HeapCapacity {
    pub const fn new(persistent: u32, temporary: u32) -> Self {
        Self { persistent, temporary }
    }

    /// 堆的总槽位数
    pub fn total(&self) -> u32 {
        self.persistent.saturating_add(self.temporary)
    }
}

/// 描述符堆配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorConfig {
    #[serde(default = "default_cbv_srv_uav")]
    pub cbv_srv_uav: HeapCapacity,

    #[serde(default = "default_sampler")]
    pub sampler: HeapCapacity,

    #[serde(default = "default_rtv")]
    pub rtv: HeapCapacity,

    #[serde(default = "default_dsv")]
    pub dsv: HeapCapacity,
}

/// 上传环形缓冲区配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 环形缓冲区总字节数
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: u64,

    /// 默认对齐（常量缓冲区要求 256 字节）
    #[serde(default = "default_alignment")]
    pub alignment: u64,
}

/// 句柄池初始容量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_buffer_pool")]
    pub buffers: u16,

    #[serde(default = "default_texture_pool")]
    pub textures: u16,

    #[serde(default = "default_shader_pool")]
    pub shaders: u16,

    #[serde(default = "default_pipeline_pool")]
    pub pipelines: u16,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_backend() -> BackendKind {
    if cfg!(feature = "vulkan") {
        BackendKind::Vulkan
    } else {
        BackendKind::Null
    }
}
fn default_buffered_frames() -> u32 { 3 }
fn default_command_lists_per_queue() -> u32 { 8 }
fn default_debug_layer() -> bool { cfg!(debug_assertions) }
fn default_cbv_srv_uav() -> HeapCapacity { HeapCapacity::new(4096, 4096) }
fn default_sampler() -> HeapCapacity { HeapCapacity::new(128, 128) }
fn default_rtv() -> HeapCapacity { HeapCapacity::new(256, 0) }
fn default_dsv() -> HeapCapacity { HeapCapacity::new(64, 0) }
fn default_ring_buffer_size() -> u64 { 16 * 1024 * 1024 }
fn default_alignment() -> u64 { 256 }
fn default_buffer_pool() -> u16 { 256 }
fn default_texture_pool() -> u16 { 256 }
fn default_shader_pool() -> u16 { 64 }
fn default_pipeline_pool() -> u16 { 64 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "dist_rhi.log".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            buffered_frames: default_buffered_frames(),
            fence_timeout_ms: None,
            command_lists_per_queue: default_command_lists_per_queue(),
            debug_layer: default_debug_layer(),
        }
    }
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            cbv_srv_uav: default_cbv_srv_uav(),
            sampler: default_sampler(),
            rtv: default_rtv(),
            dsv: default_dsv(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: default_ring_buffer_size(),
            alignment: default_alignment(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffers: default_buffer_pool(),
            textures: default_texture_pool(),
            shaders: default_shader_pool(),
            pipelines: default_pipeline_pool(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

impl Config {
    /// 从配置文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml_str(&contents)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 应用命令行参数覆盖
    ///
    /// 支持 `--null` / `--vulkan` / `--dx12` 选择后端，
    /// `--frames <n>` 设置缓冲帧数，`--debug-layer` 打开 API 调试层。
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        for arg in &args {
            match arg.as_str() {
                "--null" => self.device.backend = BackendKind::Null,
                "--vulkan" => self.device.backend = BackendKind::Vulkan,
                "--dx12" => self.device.backend = BackendKind::Dx12,
                "--debug-layer" => self.device.debug_layer = true,
                _ => {}
            }
        }

        if let Some(idx) = args.iter().position(|a| a == "--frames") {
            if let Some(frames) = args.get(idx + 1).and_then(|s| s.parse().ok()) {
                self.device.buffered_frames = frames;
            }
        }
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let device = &self.device;
        // 删除条目的帧计数是 u8，缓冲帧数再大也没有意义
        if !(1..=8).contains(&device.buffered_frames) {
            return Err(invalid("device.buffered_frames", "must be between 1 and 8").into());
        }
        // 提交时可能需要额外一个列表记录状态修正屏障
        if device.command_lists_per_queue < 2 {
            return Err(invalid("device.command_lists_per_queue", "must be at least 2").into());
        }
        if device.fence_timeout_ms == Some(0) {
            return Err(invalid("device.fence_timeout_ms", "must be greater than 0 when set").into());
        }

        let descriptors = &self.descriptors;
        if descriptors.cbv_srv_uav.total() == 0 {
            return Err(invalid("descriptors.cbv_srv_uav", "heap must have at least one slot").into());
        }
        if descriptors.cbv_srv_uav.total() > MAX_SHADER_VISIBLE_DESCRIPTORS {
            return Err(invalid(
                "descriptors.cbv_srv_uav",
                format!("shader-visible heap is limited to {} descriptors", MAX_SHADER_VISIBLE_DESCRIPTORS),
            )
            .into());
        }
        if descriptors.sampler.total() > MAX_SHADER_VISIBLE_SAMPLERS {
            return Err(invalid(
                "descriptors.sampler",
                format!("shader-visible sampler heap is limited to {} descriptors", MAX_SHADER_VISIBLE_SAMPLERS),
            )
            .into());
        }

        let upload = &self.upload;
        if !upload.alignment.is_power_of_two() {
            return Err(invalid("upload.alignment", "must be a power of two").into());
        }
        if upload.ring_buffer_size < upload.alignment {
            return Err(invalid("upload.ring_buffer_size", "must be at least one alignment unit").into());
        }

        let pools = &self.pools;
        for (field, capacity) in [
            ("pools.buffers", pools.buffers),
            ("pools.textures", pools.textures),
            ("pools.shaders", pools.shaders),
            ("pools.pipelines", pools.pipelines),
        ] {
            if capacity == 0 || capacity == u16::MAX {
                return Err(invalid(field, "must be between 1 and 65534").into());
            }
        }

        Ok(())
    }
}

impl BackendKind {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Null => "Null",
            BackendKind::Vulkan => "Vulkan",
            BackendKind::Dx12 => "DirectX 12",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device.buffered_frames, 3);
        assert_eq!(config.descriptors.cbv_srv_uav, HeapCapacity::new(4096, 4096));
        assert_eq!(config.upload.alignment, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.device.buffered_frames = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.upload.alignment = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.descriptors.sampler = HeapCapacity::new(2048, 1);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pools.textures = u16::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.device.command_lists_per_queue = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [device]
            backend = "null"
            buffered_frames = 2

            [descriptors.rtv]
            persistent = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.device.backend, BackendKind::Null);
        assert_eq!(config.device.buffered_frames, 2);
        assert_eq!(config.descriptors.rtv, HeapCapacity::new(32, 0));
        // 未出现的段落使用默认值
        assert_eq!(config.upload.ring_buffer_size, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["dist_rhi", "--null", "--frames", "2", "--frames-ignored"]);
        assert_eq!(config.device.backend, BackendKind::Null);
        assert_eq!(config.device.buffered_frames, 2);

        // 无法解析的数值保持原值
        config.apply_args(["--frames", "many"]);
        assert_eq!(config.device.buffered_frames, 2);
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let config = Config::from_file_or_default("does/not/exist.toml");
        assert_eq!(config.device.buffered_frames, 3);
        assert!(matches!(
            Config::from_file("does/not/exist.toml"),
            Err(crate::core::error::RhiError::Config(ConfigError::FileNotFound(_)))
        ));
    }
}
