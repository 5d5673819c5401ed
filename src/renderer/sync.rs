//! GPU 同步机制模块
//!
//! 提供 CPU-GPU 同步原语。每个命令队列拥有一个单调递增的栅栏，
//! 提交命令列表后对栅栏 signal 一个新值，得到一个 [`SyncPoint`]。
//! 描述符堆的临时区、上传环形缓冲区和命令列表池都以 `SyncPoint` 作为回收条件。
//!
//! # 阻塞点
//!
//! [`GpuFence::wait`] 是整个 RHI 中唯一的阻塞原语：帧边界同步、环形缓冲区背压、
//! 命令列表池耗尽时调用。可以带超时，超时返回 [`RhiError::DeviceLost`]。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::error::{Result, RhiError};

/// Fence 值
///
/// 用于CPU-GPU同步的单调递增值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FenceValue(u64);

impl FenceValue {
    /// 创建新的Fence值
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 递增Fence值
    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// 下一个Fence值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fence 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// 尚未signal
    NotSignaled,
    /// 已经signal
    Signaled,
}

/// GPU 栅栏
///
/// 后端实现：Vulkan 时间线信号量、D3D12 `ID3D12Fence`、空后端的 [`SoftwareFence`]。
pub trait GpuFence: Send + Sync + 'static {
    /// GPU 已经完成的最大值
    fn completed_value(&self) -> u64;

    /// 阻塞直到栅栏达到 `value`
    ///
    /// `timeout` 为 `None` 时无限等待；超时返回 [`RhiError::DeviceLost`]。
    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()>;

    fn is_complete(&self, value: u64) -> bool {
        self.completed_value() >= value
    }
}

/// 超时对应的设备丢失错误
pub fn device_lost(value: u64, timeout: Duration) -> RhiError {
    RhiError::DeviceLost {
        value,
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// 队列栅栏上的一个同步点
///
/// 由 `CommandQueue::signal` / `Device::execute` 返回。
#[derive(Clone)]
pub struct SyncPoint {
    fence: Arc<dyn GpuFence>,
    value: FenceValue,
}

impl SyncPoint {
    pub fn new(fence: Arc<dyn GpuFence>, value: FenceValue) -> Self {
        Self { fence, value }
    }

    pub fn value(&self) -> FenceValue {
        self.value
    }

    pub fn is_complete(&self) -> bool {
        self.fence.is_complete(self.value.value())
    }

    pub fn status(&self) -> FenceStatus {
        if self.is_complete() {
            FenceStatus::Signaled
        } else {
            FenceStatus::NotSignaled
        }
    }

    /// 阻塞等待同步点完成
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        self.fence.wait(self.value.value(), timeout)
    }

    /// 两个同步点是否属于同一个栅栏
    pub fn same_fence(&self, other: &SyncPoint) -> bool {
        Arc::ptr_eq(&self.fence, &other.fence)
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("value", &self.value)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// 纯 CPU 的栅栏
///
/// 空后端用它模拟 GPU 进度，测试中也可以手动 signal。
#[derive(Default)]
pub struct SoftwareFence {
    completed: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SoftwareFence {
    pub fn new(initial_value: u64) -> Self {
        Self {
            completed: AtomicU64::new(initial_value),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// 标记 `value` 及之前的工作完成
    ///
    /// 栅栏值只增不减，较小的值被忽略。
    pub fn signal(&self, value: u64) {
        let _guard = self.lock.lock();
        self.completed.fetch_max(value, Ordering::AcqRel);
        self.cond.notify_all();
    }
}

impl GpuFence for SoftwareFence {
    fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock.lock();
        while self.completed_value() < value {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out()
                        && self.completed_value() < value
                    {
                        return Err(device_lost(value, timeout.unwrap_or_default()));
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SoftwareFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareFence")
            .field("completed", &self.completed_value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fence_value() {
        let mut value = FenceValue::new(0);
        assert_eq!(value.value(), 0);

        value.increment();
        assert_eq!(value.value(), 1);

        let next = value.next();
        assert_eq!(next.value(), 2);
        assert!(next > value);
    }

    #[test]
    fn test_software_fence_monotonic() {
        let fence = SoftwareFence::new(0);
        fence.signal(5);
        fence.signal(3);
        assert_eq!(fence.completed_value(), 5);
        assert!(fence.is_complete(4));
        assert!(!fence.is_complete(6));
    }

    #[test]
    fn test_sync_point_status() {
        let fence = Arc::new(SoftwareFence::new(0));
        let point = SyncPoint::new(fence.clone(), FenceValue::new(1));
        assert_eq!(point.status(), FenceStatus::NotSignaled);

        fence.signal(1);
        assert_eq!(point.status(), FenceStatus::Signaled);
        assert!(point.wait(None).is_ok());
    }

    #[test]
    fn test_wait_wakes_on_signal() {
        let fence = Arc::new(SoftwareFence::new(0));
        let signaler = {
            let fence = fence.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                fence.signal(2);
            })
        };

        fence.wait(2, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(fence.completed_value(), 2);
        signaler.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_is_device_lost() {
        let fence = SoftwareFence::new(0);
        let err = fence.wait(1, Some(Duration::from_millis(5))).unwrap_err();
        assert!(err.is_device_lost());
    }

    #[test]
    fn test_same_fence() {
        let a: Arc<dyn GpuFence> = Arc::new(SoftwareFence::new(0));
        let b: Arc<dyn GpuFence> = Arc::new(SoftwareFence::new(0));
        let p1 = SyncPoint::new(a.clone(), FenceValue::new(1));
        let p2 = SyncPoint::new(a, FenceValue::new(2));
        let p3 = SyncPoint::new(b, FenceValue::new(1));
        assert!(p1.same_fence(&p2));
        assert!(!p1.same_fence(&p3));
    }
}
