//! 契约检查
//!
//! 调用方违反 API 契约（删除过期句柄、重复释放描述符、在复制队列上请求渲染目标状态、
//! 关闭时仍有存活句柄）时走这里：
//!
//! - 始终以 `error` 级别记录到 `dist_rhi::contract`；
//! - 开启 `debug_assertions` 时 panic；
//! - Release 构建中继续运行，由调用点决定如何降级（通常是忽略该操作）。

use std::fmt;

/// 报告一次契约违规
#[track_caller]
pub fn violation(args: fmt::Arguments<'_>) {
    let location = std::panic::Location::caller();
    tracing::error!(
        target: "dist_rhi::contract",
        file = location.file(),
        line = location.line(),
        "{}",
        args
    );
    if cfg!(debug_assertions) {
        panic!("contract violation: {}", args);
    }
}

/// 检查条件，不满足时报告契约违规
///
/// 返回条件本身，Release 构建下调用方据此提前返回：
///
/// ```ignore
/// if !rhi_ensure!(index < self.capacity, "index {} out of range", index) {
///     return;
/// }
/// ```
#[macro_export]
macro_rules! rhi_ensure {
    ($cond:expr, $($arg:tt)+) => {{
        let ok: bool = $cond;
        if !ok {
            $crate::core::contract::violation(format_args!($($arg)+));
        }
        ok
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_ensure_passes_through_true() {
        assert!(crate::rhi_ensure!(1 + 1 == 2, "arithmetic is broken"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "contract violation")]
    fn test_ensure_panics_in_debug() {
        crate::rhi_ensure!(false, "handle {} is stale", 7);
    }
}
