//! 句柄与对象池
//!
//! `Pool<T>` 是带代数（generation）校验的槽位分配器，`Handle<T>` 是指向槽位的轻量值类型。
//!
//! # 设计原则
//!
//! - 句柄不拥有存储，池拥有对象；句柄可以随意复制
//! - 删除时槽位代数加一，所有旧句柄立即失效，`get` 返回 `None`
//! - 空闲列表先进先出，被删除的槽位最晚被复用
//! - 扩容按 1.5 倍进行，已有句柄的索引不变

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use tracing::warn;

use crate::core::error::{Result, RhiError};
use crate::rhi_ensure;

/// 无效句柄的索引
pub const INVALID_INDEX: u16 = 0xFFFF;

/// 池能容纳的最大槽位数（`INVALID_INDEX` 保留）
pub const MAX_POOL_CAPACITY: usize = INVALID_INDEX as usize;

/// 带代数校验的句柄
pub struct Handle<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// 无效句柄
    pub const fn invalid() -> Self {
        Self {
            index: INVALID_INDEX,
            generation: 0,
            _marker: PhantomData,
        }
    }

    fn new(index: u16, generation: u16) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    /// 索引是否有效（不检查代数）
    pub fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }

    /// 打包成 32 位整数，用作状态跟踪等处的键
    pub fn to_bits(&self) -> u32 {
        (u32::from(self.generation) << 16) | u32::from(self.index)
    }

    /// `to_bits` 的逆操作
    pub fn from_bits(bits: u32) -> Self {
        Self::new((bits & 0xFFFF) as u16, (bits >> 16) as u16)
    }
}

// 手动实现，避免给 T 加上不必要的约束
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({}v{})", self.index, self.generation)
        } else {
            f.write_str("Handle(invalid)")
        }
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Slot<T> {
    data: Option<T>,
    generation: u16,
}

/// 对象池
pub struct Pool<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: VecDeque<u16>,
    live: usize,
}

impl<T> Pool<T> {
    /// 创建对象池
    ///
    /// `name` 只用于日志。
    pub fn new(name: &'static str, initial_capacity: u16) -> Self {
        let mut pool = Self {
            name,
            slots: Vec::new(),
            free: VecDeque::new(),
            live: 0,
        };
        pool.grow_to(usize::from(initial_capacity.min(INVALID_INDEX)));
        pool
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 分配槽位并放入对象
    ///
    /// 没有空闲槽位时先扩容。只有 16 位索引空间耗尽时才会失败。
    pub fn allocate(&mut self, value: T) -> Result<Handle<T>> {
        if self.free.is_empty() {
            let old = self.slots.len();
            if old >= MAX_POOL_CAPACITY {
                return Err(RhiError::PoolExhausted {
                    pool: self.name,
                    capacity: old,
                });
            }
            let new = (old + old / 2).max(old + 1).min(MAX_POOL_CAPACITY);
            warn!(
                pool = self.name,
                old_capacity = old,
                new_capacity = new,
                "Pool grew past its initial capacity"
            );
            self.grow_to(new);
        }

        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                return Err(RhiError::PoolExhausted {
                    pool: self.name,
                    capacity: self.slots.len(),
                })
            }
        };
        let slot = &mut self.slots[usize::from(index)];
        slot.data = Some(value);
        self.live += 1;
        Ok(Handle::new(index, slot.generation))
    }

    /// 获取对象，无效或过期句柄返回 `None`
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.data.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(usize::from(handle.index))?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.data.as_mut()
    }

    /// 句柄当前是否指向存活对象
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// 删除对象并返回它
    ///
    /// 槽位代数加一，索引回到空闲队列尾部。
    /// 无效或过期句柄意味着重复删除或数据损坏，属于契约违规。
    pub fn delete(&mut self, handle: Handle<T>) -> Option<T> {
        let name = self.name;
        let live = match self.slots.get(usize::from(handle.index)) {
            Some(slot) => slot.generation == handle.generation && slot.data.is_some(),
            None => false,
        };
        if !rhi_ensure!(live, "pool '{}': delete of stale or invalid {:?}", name, handle) {
            return None;
        }

        let slot = &mut self.slots[usize::from(handle.index)];
        let value = slot.data.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(handle.index);
        self.live -= 1;
        value
    }

    /// 所有槽位都空闲时为真
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// 存活对象数量
    pub fn len(&self) -> usize {
        self.live
    }

    /// 当前槽位总数
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 遍历存活对象
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.data
                .as_ref()
                .map(|data| (Handle::new(index as u16, slot.generation), data))
        })
    }

    /// 取出所有存活对象
    ///
    /// 用于关闭时回收泄漏对象的后端资源，被取出的句柄全部失效。
    pub fn drain(&mut self) -> Vec<(Handle<T>, T)> {
        let mut drained = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(data) = slot.data.take() {
                drained.push((Handle::new(index as u16, slot.generation), data));
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push_back(index as u16);
            }
        }
        self.live = 0;
        drained
    }

    fn grow_to(&mut self, new_capacity: usize) {
        let old = self.slots.len();
        self.slots.reserve(new_capacity.saturating_sub(old));
        for index in old..new_capacity {
            self.slots.push(Slot {
                data: None,
                generation: 0,
            });
            self.free.push_back(index as u16);
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        if self.live > 0 && !std::thread::panicking() {
            crate::core::contract::violation(format_args!(
                "pool '{}' destroyed with {} live handles",
                self.name, self.live
            ));
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("live", &self.live)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_get() {
        let mut pool = Pool::new("test", 4);
        let a = pool.allocate(String::from("a")).unwrap();
        let b = pool.allocate(String::from("b")).unwrap();

        assert_eq!(pool.get(a).map(String::as_str), Some("a"));
        assert_eq!(pool.get(b).map(String::as_str), Some("b"));
        assert_eq!(pool.len(), 2);

        pool.delete(a);
        pool.delete(b);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_invalid_handle() {
        let pool: Pool<u32> = Pool::new("test", 2);
        let handle = Handle::<u32>::invalid();
        assert!(!handle.is_valid());
        assert!(pool.get(handle).is_none());
        assert_eq!(Handle::<u32>::default(), handle);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        // 初始容量为 1，删除后同一个槽位被复用
        let mut pool = Pool::new("test", 1);
        let old = pool.allocate(1u32).unwrap();
        pool.delete(old);

        let new = pool.allocate(2u32).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(pool.get(old).is_none());
        assert_eq!(pool.get(new), Some(&2));

        pool.delete(new);
    }

    #[test]
    fn test_free_list_is_fifo() {
        let mut pool = Pool::new("test", 3);
        let a = pool.allocate(0u8).unwrap();
        let b = pool.allocate(1u8).unwrap();
        let c = pool.allocate(2u8).unwrap();

        pool.delete(b);
        pool.delete(a);

        // 先释放的 b 先被复用
        let d = pool.allocate(3u8).unwrap();
        let e = pool.allocate(4u8).unwrap();
        assert_eq!(d.index(), b.index());
        assert_eq!(e.index(), a.index());

        for h in [c, d, e] {
            pool.delete(h);
        }
    }

    #[test]
    fn test_growth_preserves_handles() {
        let mut pool = Pool::new("test", 4);
        let handles: Vec<_> = (0..10u32).map(|i| pool.allocate(i * 10).unwrap()).collect();
        assert!(pool.capacity() >= 10);

        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get(*h), Some(&(i as u32 * 10)));
        }
        for h in handles {
            pool.delete(h);
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn test_growth_factor() {
        let mut pool = Pool::new("test", 2);
        let a = pool.allocate(()).unwrap();
        let b = pool.allocate(()).unwrap();
        let c = pool.allocate(()).unwrap();
        // 2 -> 3
        assert_eq!(pool.capacity(), 3);
        let d = pool.allocate(()).unwrap();
        // 3 -> 4
        assert_eq!(pool.capacity(), 4);
        for h in [a, b, c, d] {
            pool.delete(h);
        }
    }

    #[test]
    fn test_end_to_end_reuse_scenario() {
        let mut pool = Pool::new("test", 2);
        let h1 = pool.allocate("one").unwrap();
        let h2 = pool.allocate("two").unwrap();
        let h3 = pool.allocate("three").unwrap(); // 触发扩容

        pool.delete(h2);
        let h4 = pool.allocate("four").unwrap();

        // 复用 h2 的槽位，代数加一
        assert_eq!(h4.index(), h2.index());
        assert_eq!(h4.generation(), h2.generation().wrapping_add(1));
        assert!(pool.get(h2).is_none());
        assert_eq!(pool.get(h4), Some(&"four"));
        assert!(!pool.is_empty());

        for h in [h1, h3, h4] {
            pool.delete(h);
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn test_delete_returns_value() {
        let mut pool = Pool::new("test", 1);
        let h = pool.allocate(vec![1, 2, 3]).unwrap();
        assert_eq!(pool.delete(h), Some(vec![1, 2, 3]));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "contract violation")]
    fn test_double_delete_asserts() {
        let mut pool = Pool::new("test", 1);
        let h = pool.allocate(5u32).unwrap();
        pool.delete(h);
        pool.delete(h);
    }

    #[test]
    fn test_drain() {
        let mut pool = Pool::new("test", 4);
        let a = pool.allocate(1).unwrap();
        let _b = pool.allocate(2).unwrap();

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.get(a).is_none());
    }

    #[test]
    fn test_iter() {
        let mut pool = Pool::new("test", 4);
        let a = pool.allocate('a').unwrap();
        let b = pool.allocate('b').unwrap();
        let c = pool.allocate('c').unwrap();
        pool.delete(b);

        let live: Vec<_> = pool.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(a, 'a'), (c, 'c')]);

        pool.delete(a);
        pool.delete(c);
    }
}
