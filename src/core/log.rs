//! 日志系统模块
//!
//! 基于 `tracing` 提供结构化的日志记录功能。
//!
//! # 特性
//!
//! - 结构化日志：支持键值对，例如 `warn!(pool = "textures", old, new, "Pool grew")`
//! - 灵活输出：支持控制台和按天滚动的日志文件
//! - 过滤：`RUST_LOG` 环境变量优先于配置中的级别
//!
//! target 沿用模块路径，只有契约违规使用固定 target。常用的过滤目标：
//!
//! | target | 内容 |
//! |---|---|
//! | `dist_rhi::contract` | 契约违规 |
//! | `dist_rhi::renderer::device` | 设备、帧循环、延迟删除、状态修正 |
//! | `dist_rhi::gfx` | 后端 API 调用 |

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use std::path::Path;

use super::config::{LogLevel, LoggingConfig};
use super::error::{Result, RhiError};

/// 初始化日志系统
///
/// 必须在程序开始时调用一次。重复初始化返回 [`RhiError::Log`]，不会 panic。
///
/// # 参数
///
/// * `level` - 日志级别（`RUST_LOG` 已设置时被覆盖）
/// * `file_output` - 是否输出到文件
/// * `log_file_path` - 日志文件路径（可选，默认为 "dist_rhi.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true);

    let file_layer = if file_output {
        // 解析日志文件路径
        let log_path = log_file_path.unwrap_or("dist_rhi.log");
        let path = Path::new(log_path);
        let directory = path.parent().unwrap_or(Path::new("."));
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("dist_rhi.log");

        // 创建滚动文件 appender（每天滚动）
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);

        Some(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_ansi(false) // 文件不需要 ANSI 颜色
                .with_writer(file_appender),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| RhiError::Log(e.to_string()))
}

/// 按配置初始化日志系统
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_logger(config.level, config.file_output, Some(config.log_file.as_str()))
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// 日志级别转换
impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(level_directive(LogLevel::Trace), "trace");
    }

    #[test]
    fn test_subsystem_target_directives() {
        let directives = "warn,dist_rhi::contract=error,dist_rhi::renderer::device=trace,dist_rhi::gfx=debug";
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
