//! 核心功能模块
//!
//! 本模块提供 RHI 的基础设施：日志系统、配置管理、错误处理和契约检查。
//! 这些模块独立于具体的图形 API。
//!
//! # 模块组织
//!
//! - `log`：日志系统，基于 tracing 的结构化日志
//! - `config`：配置管理，从 TOML 加载容量与后端选择
//! - `error`：错误处理，定义统一的错误类型
//! - `contract`：契约检查，Debug 断言 / Release 记录

pub mod log;
pub mod config;
pub mod error;
pub mod contract;

// 重新导出常用类型，方便使用
pub use error::{Result, RhiError, BackendError, BackendApi, ConfigError};
pub use config::Config;
