//! 延迟删除队列
//!
//! 销毁资源时不立即释放，而是排队等待 `buffered_frames` 帧。
//! CPU 最多领先 GPU `buffered_frames` 帧，因此到期时 GPU 一定不再引用该资源，
//! 常规路径上不需要等待栅栏。
//!
//! 条目严格从队首出队，遇到第一个未到期的条目即停止，保证先入队的先完成。

use std::collections::VecDeque;

use tracing::{trace, warn};

struct DeletionEntry<T> {
    payload: T,
    frames_elapsed: u8,
}

/// 延迟删除队列
///
/// `T` 是待销毁对象的描述；到期时交给 `tick` 的回调执行真正的释放。
pub struct DeferredDeletionQueue<T> {
    entries: VecDeque<DeletionEntry<T>>,
    buffered_frames: u8,
}

impl<T> DeferredDeletionQueue<T> {
    /// 创建队列，`buffered_frames` 至少为 1
    pub fn new(buffered_frames: u8) -> Self {
        Self {
            entries: VecDeque::new(),
            buffered_frames: buffered_frames.max(1),
        }
    }

    pub fn buffered_frames(&self) -> u8 {
        self.buffered_frames
    }

    /// 入队一个待销毁对象
    pub fn enqueue(&mut self, payload: T) {
        self.entries.push_back(DeletionEntry {
            payload,
            frames_elapsed: 0,
        });
    }

    /// 推进一帧
    ///
    /// 所有条目的帧计数加一，然后从队首依次销毁已到期的条目。返回本次销毁的数量。
    pub fn tick(&mut self, mut finalize: impl FnMut(T)) -> usize {
        for entry in self.entries.iter_mut() {
            entry.frames_elapsed = entry.frames_elapsed.saturating_add(1);
        }

        let mut finalized = 0;
        while self
            .entries
            .front()
            .map_or(false, |e| e.frames_elapsed >= self.buffered_frames)
        {
            if let Some(entry) = self.entries.pop_front() {
                finalize(entry.payload);
                finalized += 1;
            }
        }

        if finalized > 0 {
            trace!(finalized, pending = self.entries.len(), "Deferred deletions finalized");
        }
        finalized
    }

    /// 立即销毁所有条目，不论帧数
    ///
    /// 只在 GPU 已经空闲时调用（关闭前先等待所有队列）。
    pub fn force_drain(&mut self, mut finalize: impl FnMut(T)) -> usize {
        let count = self.entries.len();
        while let Some(entry) = self.entries.pop_front() {
            finalize(entry.payload);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Drop for DeferredDeletionQueue<T> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                pending = self.entries.len(),
                "Deferred deletion queue dropped without draining"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        let mut queue = DeferredDeletionQueue::new(3);
        let mut finalized = Vec::new();

        queue.enqueue("a");
        assert_eq!(queue.tick(|p| finalized.push(p)), 0);
        assert_eq!(queue.tick(|p| finalized.push(p)), 0);
        assert!(finalized.is_empty());
        // 第三次 tick 正好到期
        assert_eq!(queue.tick(|p| finalized.push(p)), 1);
        assert_eq!(finalized, vec!["a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_five_deletions_across_ticks() {
        let mut queue = DeferredDeletionQueue::new(3);
        let mut finalized: Vec<u32> = Vec::new();
        let mut tick = 0u32;

        // 第 0..4 个 tick 之后各入队一个
        for id in 0..5u32 {
            queue.enqueue(id);
            tick += 1;
            queue.tick(|p| finalized.push(p));
            if tick == 3 {
                assert_eq!(finalized, vec![0]);
            }
        }
        assert_eq!(tick, 5);

        while tick < 7 {
            tick += 1;
            queue.tick(|p| finalized.push(p));
        }
        assert_eq!(finalized, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_age_ordering() {
        let mut queue = DeferredDeletionQueue::new(2);
        let mut order = Vec::new();

        queue.enqueue(1);
        queue.enqueue(2);
        queue.tick(|p| order.push(p));
        queue.enqueue(3);
        queue.tick(|p| order.push(p));
        assert_eq!(order, vec![1, 2]);
        queue.tick(|p| order.push(p));
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_force_drain() {
        let mut queue = DeferredDeletionQueue::new(3);
        queue.enqueue(1);
        queue.enqueue(2);
        queue.tick(|_| panic!("nothing is due yet"));

        let mut drained = Vec::new();
        assert_eq!(queue.force_drain(|p| drained.push(p)), 2);
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closure_payload() {
        // 队列也可以直接存放销毁闭包
        let mut queue: DeferredDeletionQueue<Box<dyn FnOnce(&mut Vec<&'static str>)>> =
            DeferredDeletionQueue::new(1);
        let mut log = Vec::new();
        queue.enqueue(Box::new(|log: &mut Vec<&'static str>| log.push("texture released")));
        queue.tick(|destroy| destroy(&mut log));
        assert_eq!(log, vec!["texture released"]);
    }
}
