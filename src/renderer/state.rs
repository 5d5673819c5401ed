//! 资源状态跟踪
//!
//! 每个命令上下文内嵌一个 [`ResourceStateTracker`]，在每次资源访问前调用
//! [`ResourceStateTracker::insert_barrier`]，生成最少且正确的转换屏障：
//!
//! 1. 首次使用或资源被标记为重置：状态提升（只记录，不发屏障）；
//! 2. 状态相同：无操作；
//! 3. 已处于覆盖本次读取的着色器资源只读状态：无操作；
//! 4. 否则校验队列合法性，追加一条转换屏障并更新记录。
//!
//! 屏障累积成一批，在复制 / 分派之前由 [`ResourceStateTracker::submit_barriers`] 一次性提交。
//! 跨队列的顺序只由栅栏保证，跟踪器只校验状态对当前队列类型是否合法。
//!
//! 上下文之间的状态由设备持有的 [`GlobalResourceStates`] 衔接：上下文内的首次使用
//! 只在本地提升，提交时与上一次提交留下的状态对齐，差异变成在该上下文之前执行的修正屏障。
//! 只有从未提交过或被标记为重置的资源才真正依赖提升。

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;

use crate::rhi_ensure;

use super::command::QueueType;

bitflags! {
    /// 资源状态（与 D3D12_RESOURCE_STATES 对应）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        const INDIRECT_ARGUMENT = 1 << 8;
        const COPY_DEST = 1 << 9;
        const COPY_SOURCE = 1 << 10;
        const PRESENT = 1 << 11;

        const ALL_SHADER_RESOURCE = Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits();
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceState {
    /// 写状态只能单独出现
    pub fn is_write(self) -> bool {
        self.intersects(
            ResourceState::RENDER_TARGET
                | ResourceState::UNORDERED_ACCESS
                | ResourceState::DEPTH_WRITE
                | ResourceState::COPY_DEST,
        )
    }

    /// 非空且只包含着色器资源读取位
    pub fn is_shader_resource(self) -> bool {
        !self.is_empty() && ResourceState::ALL_SHADER_RESOURCE.contains(self)
    }
}

impl QueueType {
    /// 该队列类型不允许的状态位
    pub fn forbidden_states(self) -> ResourceState {
        match self {
            QueueType::Direct => ResourceState::empty(),
            QueueType::Compute => {
                ResourceState::RENDER_TARGET
                    | ResourceState::DEPTH_WRITE
                    | ResourceState::DEPTH_READ
                    | ResourceState::PIXEL_SHADER_RESOURCE
                    | ResourceState::INDEX_BUFFER
                    | ResourceState::PRESENT
            }
            QueueType::Copy => !(ResourceState::COPY_SOURCE | ResourceState::COPY_DEST),
        }
    }

    /// 状态在该队列上是否合法
    pub fn supports_state(self, state: ResourceState) -> bool {
        !state.intersects(self.forbidden_states())
    }
}

/// 子资源选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subresource {
    /// 所有子资源
    All,
    /// 单个子资源（mip + 数组层的平铺下标）
    Index(u32),
}

/// 被跟踪资源的标识
///
/// 由资源类型和池句柄位组成，句柄的代数保证槽位复用后不会撞键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Buffer(u32),
    Texture(u32),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Buffer(bits) => write!(f, "buffer#{:08x}", bits),
            ResourceKey::Texture(bits) => write!(f, "texture#{:08x}", bits),
        }
    }
}

/// 可以被状态跟踪的资源
pub trait TrackedResource {
    fn resource_key(&self) -> ResourceKey;

    /// 子资源数量，缓冲区为 1
    fn subresource_count(&self) -> u32;

    /// 取出并清除“重置状态”标记
    fn take_reset_state(&self) -> bool;
}

/// 一条待提交的屏障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: ResourceKey,
        subresource: Subresource,
        before: ResourceState,
        after: ResourceState,
    },
    /// 读写冒险屏障，`None` 表示所有 UAV 访问
    Uav { resource: Option<ResourceKey> },
}

/// 跟踪统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub promotions: u32,
    pub transitions: u32,
    pub skipped: u32,
    pub uav_barriers: u32,
    pub flushes: u32,
}

/// 一个资源在一次录制中的状态
#[derive(Debug, Clone)]
struct ResourceRecord {
    /// 当前状态，`None` 表示本次录制尚未使用
    current: Vec<Option<ResourceState>>,
    /// 首次使用时提升到的状态
    entry: Vec<Option<ResourceState>>,
    /// 录制中遇到过重置标记，之前提交留下的状态作废
    reset: bool,
}

impl ResourceRecord {
    fn new(count: u32) -> Self {
        Self {
            current: vec![None; count as usize],
            entry: vec![None; count as usize],
            reset: false,
        }
    }

    fn ensure_len(&mut self, count: u32) {
        if self.current.len() < count as usize {
            self.current.resize(count as usize, None);
            self.entry.resize(count as usize, None);
        }
    }
}

/// 资源状态跟踪器
pub struct ResourceStateTracker {
    queue_type: QueueType,
    states: HashMap<ResourceKey, ResourceRecord>,
    pending: Vec<Barrier>,
    stats: TrackerStats,
}

enum Decision {
    Promote,
    Skip,
    Transition(ResourceState),
}

impl ResourceStateTracker {
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            queue_type,
            states: HashMap::new(),
            pending: Vec::new(),
            stats: TrackerStats::default(),
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// 在访问资源之前插入状态转换
    pub fn insert_barrier(&mut self, resource: &dyn TrackedResource, new_state: ResourceState, subresource: Subresource) {
        let key = resource.resource_key();
        let count = resource.subresource_count().max(1);
        let reset = resource.take_reset_state();

        if !self.check_legal(key, new_state) {
            // Release 构建：不发屏障，按 COMMON 记录，下一次合法使用从 COMMON 转换
            let record = self.states.entry(key).or_insert_with(|| ResourceRecord::new(count));
            record.ensure_len(count);
            record.current.iter_mut().for_each(|s| *s = Some(ResourceState::COMMON));
            return;
        }

        let record = self.states.entry(key).or_insert_with(|| ResourceRecord::new(count));
        record.ensure_len(count);
        if reset {
            record.current.iter_mut().for_each(|s| *s = None);
            record.entry.iter_mut().for_each(|s| *s = None);
            record.reset = true;
        }

        let indices: Vec<u32> = match subresource {
            Subresource::All => (0..count).collect(),
            Subresource::Index(i) => {
                if !rhi_ensure!(i < count, "{}: subresource {} out of range ({} subresources)", key, i, count) {
                    return;
                }
                vec![i]
            }
        };

        // 逐个子资源决定动作
        let mut transitions: Vec<(u32, ResourceState, ResourceState)> = Vec::new();
        for &i in &indices {
            let slot = &mut record.current[i as usize];
            match decide(*slot, new_state) {
                Decision::Promote => {
                    *slot = Some(new_state);
                    if !record.reset && record.entry[i as usize].is_none() {
                        record.entry[i as usize] = Some(new_state);
                    }
                    self.stats.promotions += 1;
                }
                Decision::Skip => self.stats.skipped += 1,
                Decision::Transition(after) => {
                    let before = slot.unwrap_or(ResourceState::COMMON);
                    transitions.push((i, before, after));
                    *slot = Some(after);
                }
            }
        }

        // 记录里只会出现本队列合法的状态，before 无需再校验
        let barriers = collapse(key, count, subresource == Subresource::All, &transitions);
        self.stats.transitions += barriers.len() as u32;
        self.pending.extend(barriers);
    }

    fn check_legal(&self, key: ResourceKey, state: ResourceState) -> bool {
        if self.queue_type.supports_state(state) {
            return true;
        }
        rhi_ensure!(
            false,
            "{}: state {:?} is illegal on {:?} queue",
            key,
            state,
            self.queue_type
        )
    }

    /// 无条件插入 UAV 屏障
    pub fn insert_uav_barrier(&mut self, resource: Option<&dyn TrackedResource>) {
        self.stats.uav_barriers += 1;
        self.pending.push(Barrier::Uav {
            resource: resource.map(|r| r.resource_key()),
        });
    }

    /// 把待提交的屏障一次性交给 `sink`，然后清空
    ///
    /// 没有待提交屏障时不调用 `sink`。
    pub fn submit_barriers<E>(&mut self, sink: impl FnOnce(&[Barrier]) -> Result<(), E>) -> Result<(), E> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.stats.flushes += 1;
        let result = sink(&self.pending);
        self.pending.clear();
        result
    }

    /// 当前记录的状态（所有子资源一致时）
    pub fn current_state(&self, key: ResourceKey, subresource: Subresource) -> Option<ResourceState> {
        let record = &self.states.get(&key)?.current;
        match subresource {
            Subresource::Index(i) => record.get(i as usize).copied().flatten(),
            Subresource::All => {
                let first = record.first().copied().flatten()?;
                record.iter().all(|s| *s == Some(first)).then_some(first)
            }
        }
    }

    pub fn pending(&self) -> &[Barrier] {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// 忘记所有状态，上下文开始新的录制时调用
    pub fn reset(&mut self) {
        debug_assert!(self.pending.is_empty(), "resetting a tracker with unsubmitted barriers");
        self.states.clear();
        self.pending.clear();
        self.stats = TrackerStats::default();
    }

    /// 切换到另一个队列类型（上下文复用时）
    pub fn set_queue_type(&mut self, queue_type: QueueType) {
        self.reset();
        self.queue_type = queue_type;
    }
}

/// 设备级的资源状态记录
///
/// 保存每个资源在已提交工作结束时的状态。提交上下文时 [`GlobalResourceStates::settle`]
/// 把上下文里的首次使用与这里的记录对齐，返回必须在该上下文之前执行的修正屏障，
/// 然后写回上下文结束时的状态。必须按提交顺序调用。
#[derive(Debug, Default)]
pub struct GlobalResourceStates {
    states: HashMap<ResourceKey, Vec<Option<ResourceState>>>,
}

impl GlobalResourceStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已提交工作结束时的状态（所有子资源一致时）
    pub fn state(&self, key: ResourceKey, subresource: Subresource) -> Option<ResourceState> {
        let record = self.states.get(&key)?;
        match subresource {
            Subresource::Index(i) => record.get(i as usize).copied().flatten(),
            Subresource::All => {
                let first = record.first().copied().flatten()?;
                record.iter().all(|s| *s == Some(first)).then_some(first)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// 资源销毁后丢弃它的记录
    pub fn forget(&mut self, key: ResourceKey) {
        self.states.remove(&key);
    }

    /// 对齐一个即将提交的上下文
    pub fn settle(&mut self, tracker: &ResourceStateTracker) -> Vec<Barrier> {
        let queue_type = tracker.queue_type;
        let mut fixups = Vec::new();

        for (&key, record) in &tracker.states {
            let count = record.current.len() as u32;
            let known = self.states.entry(key).or_insert_with(|| vec![None; count as usize]);
            if known.len() < count as usize {
                known.resize(count as usize, None);
            }

            if record.reset {
                for (slot, current) in known.iter_mut().zip(&record.current) {
                    *slot = *current;
                }
                continue;
            }

            let mut transitions = Vec::new();
            let mut keep_known = vec![false; count as usize];
            for (i, entry) in record.entry.iter().enumerate() {
                let (Some(entry), Some(before)) = (*entry, known[i]) else {
                    continue;
                };
                if let Decision::Skip = decide(Some(before), entry) {
                    // 已有的着色器读取范围覆盖了首次使用，上下文内没再转换时保留更宽的状态
                    keep_known[i] = record.current[i] == Some(entry);
                    continue;
                }
                if !rhi_ensure!(
                    queue_type.supports_state(before),
                    "{}: state {:?} left by an earlier submission is illegal on {:?} queue",
                    key,
                    before,
                    queue_type
                ) {
                    continue;
                }
                transitions.push((i as u32, before, entry));
            }
            fixups.extend(collapse(key, count, true, &transitions));

            for (i, (slot, current)) in known.iter_mut().zip(&record.current).enumerate() {
                if current.is_some() && !keep_known[i] {
                    *slot = *current;
                }
            }
        }
        fixups
    }
}

/// 所有子资源一起转换且前后状态一致时合并为一条 ALL 屏障
fn collapse(
    key: ResourceKey,
    count: u32,
    whole_requested: bool,
    transitions: &[(u32, ResourceState, ResourceState)],
) -> Vec<Barrier> {
    let whole = whole_requested
        && transitions.len() == count as usize
        && transitions.windows(2).all(|w| w[0].1 == w[1].1 && w[0].2 == w[1].2);
    if whole {
        let (_, before, after) = transitions[0];
        return vec![Barrier::Transition {
            resource: key,
            subresource: Subresource::All,
            before,
            after,
        }];
    }
    transitions
        .iter()
        .map(|&(i, before, after)| Barrier::Transition {
            resource: key,
            subresource: if count == 1 { Subresource::All } else { Subresource::Index(i) },
            before,
            after,
        })
        .collect()
}

fn decide(old: Option<ResourceState>, new: ResourceState) -> Decision {
    let Some(old) = old else {
        return Decision::Promote;
    };
    if old == new {
        return Decision::Skip;
    }
    if old.is_shader_resource() && new.is_shader_resource() {
        if old.contains(new) {
            return Decision::Skip;
        }
        // 像素与非像素读取范围不同，合并成两者都可读
        return Decision::Transition(old | new);
    }
    Decision::Transition(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeResource {
        key: ResourceKey,
        subresources: u32,
        reset: Cell<bool>,
    }

    impl FakeResource {
        fn buffer(id: u32) -> Self {
            Self {
                key: ResourceKey::Buffer(id),
                subresources: 1,
                reset: Cell::new(false),
            }
        }

        fn texture(id: u32, subresources: u32) -> Self {
            Self {
                key: ResourceKey::Texture(id),
                subresources,
                reset: Cell::new(false),
            }
        }
    }

    impl TrackedResource for FakeResource {
        fn resource_key(&self) -> ResourceKey {
            self.key
        }

        fn subresource_count(&self) -> u32 {
            self.subresources
        }

        fn take_reset_state(&self) -> bool {
            self.reset.replace(false)
        }
    }

    #[test]
    fn test_first_use_promotes() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let buffer = FakeResource::buffer(1);

        tracker.insert_barrier(&buffer, ResourceState::UNORDERED_ACCESS, Subresource::All);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(
            tracker.current_state(buffer.key, Subresource::All),
            Some(ResourceState::UNORDERED_ACCESS)
        );
        assert_eq!(tracker.stats().promotions, 1);
    }

    #[test]
    fn test_same_state_is_noop() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let buffer = FakeResource::buffer(1);

        tracker.insert_barrier(&buffer, ResourceState::COPY_DEST, Subresource::All);
        tracker.insert_barrier(&buffer, ResourceState::COPY_SOURCE, Subresource::All);
        assert_eq!(tracker.pending_len(), 1);
        tracker.insert_barrier(&buffer, ResourceState::COPY_SOURCE, Subresource::All);
        assert_eq!(tracker.pending_len(), 1);
    }

    #[test]
    fn test_transition_records_before_and_after() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let texture = FakeResource::texture(3, 1);

        tracker.insert_barrier(&texture, ResourceState::RENDER_TARGET, Subresource::All);
        tracker.insert_barrier(&texture, ResourceState::PIXEL_SHADER_RESOURCE, Subresource::All);
        assert_eq!(
            tracker.pending(),
            &[Barrier::Transition {
                resource: texture.key,
                subresource: Subresource::All,
                before: ResourceState::RENDER_TARGET,
                after: ResourceState::PIXEL_SHADER_RESOURCE,
            }]
        );
    }

    #[test]
    fn test_shader_resource_compatibility() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let texture = FakeResource::texture(1, 1);

        tracker.insert_barrier(&texture, ResourceState::ALL_SHADER_RESOURCE, Subresource::All);
        tracker.insert_barrier(&texture, ResourceState::PIXEL_SHADER_RESOURCE, Subresource::All);
        tracker.insert_barrier(&texture, ResourceState::NON_PIXEL_SHADER_RESOURCE, Subresource::All);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.stats().skipped, 2);
    }

    #[test]
    fn test_shader_resource_scopes_widen() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let texture = FakeResource::texture(1, 1);

        tracker.insert_barrier(&texture, ResourceState::NON_PIXEL_SHADER_RESOURCE, Subresource::All);
        tracker.insert_barrier(&texture, ResourceState::PIXEL_SHADER_RESOURCE, Subresource::All);
        assert_eq!(tracker.pending_len(), 1);
        assert_eq!(
            tracker.current_state(texture.key, Subresource::All),
            Some(ResourceState::ALL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn test_reset_flag_forces_promotion() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let texture = FakeResource::texture(1, 1);

        tracker.insert_barrier(&texture, ResourceState::RENDER_TARGET, Subresource::All);
        texture.reset.set(true);
        tracker.insert_barrier(&texture, ResourceState::PRESENT, Subresource::All);
        assert_eq!(tracker.pending_len(), 0);
        assert!(!texture.reset.get());
    }

    #[test]
    fn test_per_subresource_tracking() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let texture = FakeResource::texture(7, 4);

        tracker.insert_barrier(&texture, ResourceState::COPY_DEST, Subresource::All);
        // 只转换 mip 0
        tracker.insert_barrier(&texture, ResourceState::COPY_SOURCE, Subresource::Index(0));
        assert_eq!(
            tracker.pending(),
            &[Barrier::Transition {
                resource: texture.key,
                subresource: Subresource::Index(0),
                before: ResourceState::COPY_DEST,
                after: ResourceState::COPY_SOURCE,
            }]
        );
        assert_eq!(tracker.current_state(texture.key, Subresource::All), None);

        // ALL：状态不一致，逐个子资源转换，已处于目标状态的跳过
        tracker.submit_barriers(|_| Ok::<(), ()>(())).unwrap();
        tracker.insert_barrier(&texture, ResourceState::COPY_SOURCE, Subresource::All);
        assert_eq!(tracker.pending_len(), 3);
        assert!(tracker.pending().iter().all(|b| matches!(
            b,
            Barrier::Transition { subresource: Subresource::Index(1..=3), .. }
        )));
        assert_eq!(
            tracker.current_state(texture.key, Subresource::All),
            Some(ResourceState::COPY_SOURCE)
        );
    }

    #[test]
    fn test_uniform_subresources_merge_into_one_barrier() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let texture = FakeResource::texture(2, 6);

        tracker.insert_barrier(&texture, ResourceState::COPY_DEST, Subresource::All);
        tracker.insert_barrier(&texture, ResourceState::PIXEL_SHADER_RESOURCE, Subresource::All);
        assert_eq!(tracker.pending_len(), 1);
        assert!(matches!(
            tracker.pending()[0],
            Barrier::Transition { subresource: Subresource::All, .. }
        ));
    }

    #[test]
    fn test_queue_legality_tables() {
        assert!(QueueType::Direct.supports_state(ResourceState::RENDER_TARGET));
        assert!(QueueType::Compute.supports_state(ResourceState::UNORDERED_ACCESS));
        assert!(!QueueType::Compute.supports_state(ResourceState::DEPTH_WRITE));
        assert!(QueueType::Copy.supports_state(ResourceState::COMMON));
        assert!(QueueType::Copy.supports_state(ResourceState::COPY_DEST));
        assert!(!QueueType::Copy.supports_state(ResourceState::RENDER_TARGET));
        assert!(!QueueType::Copy.supports_state(ResourceState::PIXEL_SHADER_RESOURCE));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "contract violation")]
    fn test_render_target_on_copy_queue_asserts() {
        let mut tracker = ResourceStateTracker::new(QueueType::Copy);
        let texture = FakeResource::texture(1, 1);
        tracker.insert_barrier(&texture, ResourceState::RENDER_TARGET, Subresource::All);
    }

    #[test]
    fn test_uav_barrier_is_unconditional() {
        let mut tracker = ResourceStateTracker::new(QueueType::Compute);
        let buffer = FakeResource::buffer(9);
        tracker.insert_uav_barrier(Some(&buffer));
        tracker.insert_uav_barrier(Some(&buffer));
        tracker.insert_uav_barrier(None);
        assert_eq!(tracker.pending_len(), 3);
    }

    #[test]
    fn test_submit_flushes_once() {
        let mut tracker = ResourceStateTracker::new(QueueType::Direct);
        let a = FakeResource::buffer(1);
        let b = FakeResource::buffer(2);
        for r in [&a, &b] {
            tracker.insert_barrier(r, ResourceState::COPY_DEST, Subresource::All);
            tracker.insert_barrier(r, ResourceState::VERTEX_AND_CONSTANT_BUFFER, Subresource::All);
        }

        let mut calls = 0;
        tracker
            .submit_barriers(|batch| {
                calls += 1;
                assert_eq!(batch.len(), 2);
                Ok::<(), ()>(())
            })
            .unwrap();
        tracker.submit_barriers(|_| -> Result<(), ()> { panic!("empty batch must not be submitted") }).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.stats().flushes, 1);
    }

    #[test]
    fn test_copy_queue_transitions_between_legal_states() {
        let mut tracker = ResourceStateTracker::new(QueueType::Copy);
        let buffer = FakeResource::buffer(4);

        tracker.insert_barrier(&buffer, ResourceState::COPY_DEST, Subresource::All);
        tracker.insert_barrier(&buffer, ResourceState::COPY_SOURCE, Subresource::All);
        tracker.insert_barrier(&buffer, ResourceState::COMMON, Subresource::All);
        assert_eq!(tracker.stats().transitions, 2);
        assert!(tracker.pending().iter().all(|b| match b {
            Barrier::Transition { before, after, .. } => {
                QueueType::Copy.supports_state(*before) && QueueType::Copy.supports_state(*after)
            }
            Barrier::Uav { .. } => false,
        }));
    }

    #[test]
    fn test_settle_first_submission_emits_nothing() {
        let mut global = GlobalResourceStates::new();
        let mut tracker = ResourceStateTracker::new(QueueType::Copy);
        let buffer = FakeResource::buffer(1);
        tracker.insert_barrier(&buffer, ResourceState::COPY_DEST, Subresource::All);

        assert!(global.settle(&tracker).is_empty());
        assert_eq!(global.state(buffer.key, Subresource::All), Some(ResourceState::COPY_DEST));
    }

    #[test]
    fn test_settle_emits_fixup_against_previous_submission() {
        let mut global = GlobalResourceStates::new();
        let buffer = FakeResource::buffer(1);

        let mut first = ResourceStateTracker::new(QueueType::Copy);
        first.insert_barrier(&buffer, ResourceState::COPY_DEST, Subresource::All);
        global.settle(&first);

        let mut second = ResourceStateTracker::new(QueueType::Copy);
        second.insert_barrier(&buffer, ResourceState::COPY_SOURCE, Subresource::All);
        second.insert_barrier(&buffer, ResourceState::COPY_DEST, Subresource::All);
        assert_eq!(second.stats().promotions, 1);

        let fixups = global.settle(&second);
        assert_eq!(fixups.len(), 1);
        assert!(matches!(
            fixups[0],
            Barrier::Transition {
                before: ResourceState::COPY_DEST,
                after: ResourceState::COPY_SOURCE,
                ..
            }
        ));
        assert_eq!(global.state(buffer.key, Subresource::All), Some(ResourceState::COPY_DEST));
    }

    #[test]
    fn test_settle_matching_state_needs_no_fixup() {
        let mut global = GlobalResourceStates::new();
        let buffer = FakeResource::buffer(1);

        let mut first = ResourceStateTracker::new(QueueType::Direct);
        first.insert_barrier(&buffer, ResourceState::UNORDERED_ACCESS, Subresource::All);
        global.settle(&first);

        let mut second = ResourceStateTracker::new(QueueType::Direct);
        second.insert_barrier(&buffer, ResourceState::UNORDERED_ACCESS, Subresource::All);
        assert!(global.settle(&second).is_empty());
    }

    #[test]
    fn test_settle_keeps_wider_shader_read_state() {
        let mut global = GlobalResourceStates::new();
        let texture = FakeResource::texture(3, 1);
        let all_reads = ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE;

        let mut first = ResourceStateTracker::new(QueueType::Direct);
        first.insert_barrier(&texture, ResourceState::PIXEL_SHADER_RESOURCE, Subresource::All);
        first.insert_barrier(&texture, ResourceState::NON_PIXEL_SHADER_RESOURCE, Subresource::All);
        global.settle(&first);
        assert_eq!(global.state(texture.key, Subresource::All), Some(all_reads));

        let mut second = ResourceStateTracker::new(QueueType::Direct);
        second.insert_barrier(&texture, ResourceState::PIXEL_SHADER_RESOURCE, Subresource::All);
        assert!(global.settle(&second).is_empty());
        assert_eq!(global.state(texture.key, Subresource::All), Some(all_reads));
    }

    #[test]
    fn test_settle_per_subresource_fixups() {
        let mut global = GlobalResourceStates::new();
        let texture = FakeResource::texture(5, 4);

        let mut first = ResourceStateTracker::new(QueueType::Direct);
        first.insert_barrier(&texture, ResourceState::COPY_DEST, Subresource::All);
        global.settle(&first);

        let mut second = ResourceStateTracker::new(QueueType::Direct);
        second.insert_barrier(&texture, ResourceState::RENDER_TARGET, Subresource::Index(2));
        let fixups = global.settle(&second);
        assert_eq!(fixups.len(), 1);
        assert!(matches!(
            fixups[0],
            Barrier::Transition { subresource: Subresource::Index(2), after: ResourceState::RENDER_TARGET, .. }
        ));
        assert_eq!(global.state(texture.key, Subresource::Index(2)), Some(ResourceState::RENDER_TARGET));
        assert_eq!(global.state(texture.key, Subresource::Index(0)), Some(ResourceState::COPY_DEST));
        assert_eq!(global.state(texture.key, Subresource::All), None);
    }

    #[test]
    fn test_settle_reset_resource_is_promoted() {
        let mut global = GlobalResourceStates::new();
        let buffer = FakeResource::buffer(1);

        let mut first = ResourceStateTracker::new(QueueType::Copy);
        first.insert_barrier(&buffer, ResourceState::COPY_DEST, Subresource::All);
        global.settle(&first);

        buffer.reset.set(true);
        let mut second = ResourceStateTracker::new(QueueType::Copy);
        second.insert_barrier(&buffer, ResourceState::COPY_SOURCE, Subresource::All);
        assert!(global.settle(&second).is_empty());
        assert_eq!(global.state(buffer.key, Subresource::All), Some(ResourceState::COPY_SOURCE));
    }

    #[test]
    fn test_forget_drops_record() {
        let mut global = GlobalResourceStates::new();
        let buffer = FakeResource::buffer(1);
        let mut tracker = ResourceStateTracker::new(QueueType::Copy);
        tracker.insert_barrier(&buffer, ResourceState::COPY_DEST, Subresource::All);
        global.settle(&tracker);
        assert_eq!(global.len(), 1);

        global.forget(buffer.key);
        assert!(global.is_empty());
        assert_eq!(global.state(buffer.key, Subresource::All), None);
    }
}
