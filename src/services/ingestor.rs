//! 生命周期事件接入
//!
//! 每个身份的状态机: Unknown -> Tracked -> Removed。事件流是尽力而为的，
//! 重复、缺失、乱序的事件都按空操作处理，不会向上抛错。

use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::metrics::METRICS;
use crate::models::{
    ChangeKind, EventKind, LoadedModule, MemoryRegion, OpenHandle, ProcessIdentity,
    ProcessMetadata, RawEvent, ResourceSet, StoreChange,
};
use crate::services::change_hub::{ChangeHandler, ChangeHub, Subscription};
use crate::services::identity::IdentityResolver;
use crate::services::snapshot_store::SnapshotStore;

const TOMBSTONE_CAPACITY: usize = 4096;

/// 已移除身份的有界记录，用来拒绝迟到的重复启动事件
struct Tombstones {
    order: VecDeque<ProcessIdentity>,
    set: HashSet<ProcessIdentity>,
}

impl Tombstones {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(TOMBSTONE_CAPACITY),
            set: HashSet::with_capacity(TOMBSTONE_CAPACITY),
        }
    }

    fn insert(&mut self, identity: ProcessIdentity) {
        if !self.set.insert(identity) {
            return;
        }
        self.order.push_back(identity);
        if self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.set.contains(identity)
    }

    fn remove(&mut self, identity: &ProcessIdentity) {
        if self.set.remove(identity) {
            self.order.retain(|id| id != identity);
        }
    }
}

/// 单个事件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// 事件合法但没有改变任何状态（重复事件）
    Unchanged,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 进程启动后立即退出，无法解析身份
    Unresolvable,
    /// 所属进程未被跟踪
    Untracked,
    /// 事件属于同一 pid 的更早实例
    StaleIncarnation,
    /// 该身份已被移除
    AlreadyRemoved,
    /// 没有 pid 且没有关注目标
    NoFocus,
}

pub struct LifecycleIngestor {
    store: Arc<SnapshotStore>,
    resolver: Arc<dyn IdentityResolver>,
    hub: ChangeHub,
    tombstones: Mutex<Tombstones>,
    focus: RwLock<Option<ProcessIdentity>>,
}

impl LifecycleIngestor {
    pub fn new(
        store: Arc<SnapshotStore>,
        resolver: Arc<dyn IdentityResolver>,
        hub: ChangeHub,
    ) -> Self {
        Self {
            store,
            resolver,
            hub,
            tombstones: Mutex::new(Tombstones::new()),
            focus: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    /// 处理一个原始事件，永不 panic，永不阻塞事件源
    pub fn handle(&self, event: RawEvent) -> IngestOutcome {
        let label = event.kind.label();
        let outcome = self.dispatch(event);
        match outcome {
            IngestOutcome::Dropped(reason) => {
                debug!("Dropped {} event: {:?}", label, reason);
                METRICS.record_event(label, false);
            }
            IngestOutcome::Applied | IngestOutcome::Unchanged => {
                METRICS.record_event(label, true);
            }
        }
        outcome
    }

    fn dispatch(&self, event: RawEvent) -> IngestOutcome {
        let ts = event.timestamp;
        match event.kind {
            EventKind::ProcessStart {
                pid,
                creation_time,
                image_name,
                image_path,
                command_line,
            } => {
                let identity = match creation_time {
                    Some(created) => ProcessIdentity::new(pid, created),
                    None => match self.resolver.resolve(pid) {
                        Ok(identity) => identity,
                        Err(_) => return IngestOutcome::Dropped(DropReason::Unresolvable),
                    },
                };
                let metadata = ProcessMetadata {
                    name: image_name,
                    image_path,
                    command_line,
                };
                self.start_process(identity, metadata)
            }
            EventKind::ProcessStop { pid } => {
                let identity = match self.owner(pid, ts) {
                    Ok(identity) => identity,
                    Err(reason) => return IngestOutcome::Dropped(reason),
                };
                self.stop_process(&identity)
            }
            EventKind::ThreadStart { pid, tid } => self.apply(pid, ts, |store, id| {
                store
                    .add_thread(id, tid, ts)
                    .then_some(ChangeKind::ThreadAdded(tid))
            }),
            EventKind::ThreadStop { pid, tid } => self.apply(pid, ts, |store, id| {
                store
                    .remove_thread(id, tid, ts)
                    .then_some(ChangeKind::ThreadRemoved(tid))
            }),
            EventKind::ImageLoad {
                pid,
                path,
                base,
                size,
            } => self.apply(pid, ts, |store, id| {
                let module = LoadedModule {
                    path: path.clone(),
                    base_address: base,
                    size,
                };
                store
                    .add_module(id, module, ts)
                    .then_some(ChangeKind::ModuleLoaded(path))
            }),
            EventKind::ImageUnload { pid, path } => self.apply(pid, ts, |store, id| {
                store
                    .remove_module(id, &path, ts)
                    .then_some(ChangeKind::ModuleUnloaded(path))
            }),
            EventKind::HandleCreate {
                pid,
                handle,
                object,
                name,
            } => {
                let handle = OpenHandle {
                    value: handle,
                    handle_type: String::new(),
                    object_address: object,
                    name,
                };
                self.apply_handle(pid, ts, move |store, id| {
                    let value = handle.value;
                    store
                        .add_handle(id, handle, ts)
                        .then_some(ChangeKind::HandleOpened(value))
                })
            }
            EventKind::HandleClose { pid, handle } => self.apply_handle(pid, ts, |store, id| {
                store
                    .remove_handle(id, handle, ts)
                    .then_some(ChangeKind::HandleClosed(handle))
            }),
            EventKind::HandleDuplicate {
                source_pid,
                target_pid,
                handle,
                object,
                name,
            } => {
                // 源进程只用于诊断，复制出的句柄属于目标进程
                debug!("Handle {} duplicated from {} into {}", handle, source_pid, target_pid);
                let handle = OpenHandle {
                    value: handle,
                    handle_type: String::new(),
                    object_address: object,
                    name,
                };
                self.apply(target_pid, ts, move |store, id| {
                    let value = handle.value;
                    store
                        .add_handle(id, handle, ts)
                        .then_some(ChangeKind::HandleOpened(value))
                })
            }
            EventKind::VirtualAlloc { pid, base, size } => self.apply(pid, ts, |store, id| {
                let region = MemoryRegion {
                    base_address: base,
                    size,
                };
                store
                    .add_region(id, region, ts)
                    .then_some(ChangeKind::RegionAllocated(base))
            }),
            EventKind::VirtualFree { pid, base } => self.apply(pid, ts, |store, id| {
                store
                    .remove_region(id, base, ts)
                    .then_some(ChangeKind::RegionFreed(base))
            }),
        }
    }

    /// 查找 pid 当前跟踪的身份，并确认事件时间属于这个实例
    fn owner(&self, pid: u32, timestamp: u64) -> Result<ProcessIdentity, DropReason> {
        let identity = self
            .store
            .identity_for_pid(pid)
            .ok_or(DropReason::Untracked)?;
        if !identity.owns_timestamp(timestamp) {
            return Err(DropReason::StaleIncarnation);
        }
        Ok(identity)
    }

    fn apply<F>(&self, pid: u32, timestamp: u64, f: F) -> IngestOutcome
    where
        F: FnOnce(&SnapshotStore, &ProcessIdentity) -> Option<ChangeKind>,
    {
        match self.owner(pid, timestamp) {
            Ok(identity) => self.commit(identity, f(&self.store, &identity)),
            Err(reason) => IngestOutcome::Dropped(reason),
        }
    }

    /// 句柄事件可能不带 pid，此时归属到当前关注的进程
    fn apply_handle<F>(&self, pid: Option<u32>, timestamp: u64, f: F) -> IngestOutcome
    where
        F: FnOnce(&SnapshotStore, &ProcessIdentity) -> Option<ChangeKind>,
    {
        if let Some(pid) = pid {
            return self.apply(pid, timestamp, f);
        }
        let Some(focus) = *self.focus.read() else {
            return IngestOutcome::Dropped(DropReason::NoFocus);
        };
        // 关注的进程可能已经退出
        if !self.store.contains(&focus) {
            return IngestOutcome::Dropped(DropReason::Untracked);
        }
        if !focus.owns_timestamp(timestamp) {
            return IngestOutcome::Dropped(DropReason::StaleIncarnation);
        }
        self.commit(focus, f(&self.store, &focus))
    }

    fn commit(&self, identity: ProcessIdentity, change: Option<ChangeKind>) -> IngestOutcome {
        match change {
            Some(change) => {
                self.hub.publish(&StoreChange { identity, change });
                IngestOutcome::Applied
            }
            None => IngestOutcome::Unchanged,
        }
    }

    /// Unknown -> Tracked
    pub fn start_process(&self, identity: ProcessIdentity, metadata: ProcessMetadata) -> IngestOutcome {
        if self.tombstones.lock().contains(&identity) {
            return IngestOutcome::Dropped(DropReason::AlreadyRemoved);
        }

        match self.store.identity_for_pid(identity.pid) {
            Some(current) if current == identity => {
                // 同一实例重复启动（exec 之后），只更新元信息
                let changed = self.store.update_metadata(&identity, metadata);
                return self.commit(identity, changed.then_some(ChangeKind::MetadataChanged));
            }
            Some(current) if current.creation_time > identity.creation_time => {
                return IngestOutcome::Dropped(DropReason::StaleIncarnation);
            }
            Some(current) => {
                // 旧实例的退出事件丢失了
                debug!("pid {} reused: evicting {}", identity.pid, current);
                self.stop_process(&current);
            }
            None => {}
        }

        if !self.store.add_process(identity, metadata) {
            return IngestOutcome::Unchanged;
        }
        // 主线程 tid == pid
        self.store.add_thread(&identity, identity.pid, identity.creation_time);
        METRICS.tracked_processes.set(self.store.len() as i64);
        self.commit(identity, Some(ChangeKind::ProcessAdded))
    }

    /// Tracked -> Removed
    pub fn stop_process(&self, identity: &ProcessIdentity) -> IngestOutcome {
        self.tombstones.lock().insert(*identity);
        let removed = self.store.remove_process(identity).is_some();
        METRICS.tracked_processes.set(self.store.len() as i64);
        {
            let mut focus = self.focus.write();
            if *focus == Some(*identity) {
                *focus = None;
            }
        }
        self.commit(*identity, removed.then_some(ChangeKind::ProcessRemoved))
    }

    /// 对账时写入完整的进程状态
    pub fn seed(
        &self,
        identity: ProcessIdentity,
        metadata: ProcessMetadata,
        resources: Option<ResourceSet>,
        timestamp: u64,
    ) -> IngestOutcome {
        // 对账时 OS 刚确认过这个身份还活着，墓碑不再成立
        self.tombstones.lock().remove(&identity);
        let outcome = self.start_process(identity, metadata);
        if let Some(resources) = resources {
            if self.store.refresh_resources(&identity, resources, timestamp) {
                self.hub.publish(&StoreChange {
                    identity,
                    change: ChangeKind::Refreshed,
                });
            }
        }
        outcome
    }

    /// 设置关注目标：不带 pid 的句柄事件归属到它
    pub fn set_focus(&self, identity: Option<ProcessIdentity>) {
        *self.focus.write() = identity;
    }

    pub fn focus(&self) -> Option<ProcessIdentity> {
        *self.focus.read()
    }

    /// 关注某个进程并订阅它的变更；drop 返回值即停止关注
    pub fn watch(self: &Arc<Self>, identity: ProcessIdentity, handler: ChangeHandler) -> Watch {
        self.set_focus(Some(identity));
        Watch {
            ingestor: Arc::downgrade(self),
            identity,
            _subscription: self.hub.subscribe(Some(identity), handler),
        }
    }

    pub fn resolver(&self) -> &Arc<dyn IdentityResolver> {
        &self.resolver
    }
}

/// 对单个进程的关注，drop 后解除订阅并清除关注目标
#[must_use = "dropping the watch detaches it"]
pub struct Watch {
    ingestor: std::sync::Weak<LifecycleIngestor>,
    identity: ProcessIdentity,
    _subscription: Subscription,
}

impl Watch {
    pub fn identity(&self) -> ProcessIdentity {
        self.identity
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(ingestor) = self.ingestor.upgrade() {
            let mut focus = ingestor.focus.write();
            if *focus == Some(self.identity) {
                *focus = None;
            }
        }
    }
}
