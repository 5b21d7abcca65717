use dashmap::DashMap;

use crate::models::{
    LoadedModule, MemoryRegion, OpenHandle, ProcessIdentity, ProcessMetadata, ProcessSnapshot,
    ResourceSet,
};

/// 进程资源快照存储
///
/// 快照按身份分片加锁，不同进程的更新互不阻塞；对同一快照的修改和读取互斥，
/// 读者不会看到更新到一半的快照。删除不存在的成员是空操作。
#[derive(Default)]
pub struct SnapshotStore {
    snapshots: DashMap<ProcessIdentity, ProcessSnapshot>,
    /// pid -> 当前跟踪的身份
    pids: DashMap<u32, ProcessIdentity>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入新快照，身份已存在时不做任何事
    pub fn add_process(&self, identity: ProcessIdentity, metadata: ProcessMetadata) -> bool {
        let inserted = match self.snapshots.entry(identity) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ProcessSnapshot::new(identity, metadata));
                true
            }
        };
        if inserted {
            let mut current = self.pids.entry(identity.pid).or_insert(identity);
            if current.creation_time < identity.creation_time {
                *current = identity;
            }
        }
        inserted
    }

    /// 移除快照及其全部资源，不存在时返回 None
    pub fn remove_process(&self, identity: &ProcessIdentity) -> Option<ProcessSnapshot> {
        let removed = self.snapshots.remove(identity).map(|(_, snapshot)| snapshot);
        self.pids
            .remove_if(&identity.pid, |_, current| current == identity);
        removed
    }

    pub fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.snapshots.contains_key(identity)
    }

    /// pid 当前对应的跟踪身份
    pub fn identity_for_pid(&self, pid: u32) -> Option<ProcessIdentity> {
        self.pids.get(&pid).map(|entry| *entry)
    }

    pub fn snapshot(&self, identity: &ProcessIdentity) -> Option<ProcessSnapshot> {
        self.snapshots.get(identity).map(|entry| entry.clone())
    }

    /// 所有跟踪中的身份（按 pid 排序）
    pub fn identities(&self) -> Vec<ProcessIdentity> {
        let mut identities: Vec<ProcessIdentity> =
            self.snapshots.iter().map(|entry| *entry.key()).collect();
        identities.sort();
        identities
    }

    /// 身份与元信息
    pub fn list(&self) -> Vec<(ProcessIdentity, ProcessMetadata)> {
        let mut list: Vec<_> = self
            .snapshots
            .iter()
            .map(|entry| (*entry.key(), entry.metadata.clone()))
            .collect();
        list.sort_by_key(|(identity, _)| *identity);
        list
    }

    pub fn metadata(&self, identity: &ProcessIdentity) -> Option<ProcessMetadata> {
        self.snapshots
            .get(identity)
            .map(|entry| entry.metadata.clone())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn mutate<F>(&self, identity: &ProcessIdentity, timestamp: u64, f: F) -> bool
    where
        F: FnOnce(&mut ProcessSnapshot) -> bool,
    {
        let Some(mut snapshot) = self.snapshots.get_mut(identity) else {
            return false;
        };
        let changed = f(&mut *snapshot);
        if changed && timestamp > snapshot.last_updated {
            snapshot.last_updated = timestamp;
        }
        changed
    }

    /// 元信息变化时更新（exec 之后）
    pub fn update_metadata(&self, identity: &ProcessIdentity, metadata: ProcessMetadata) -> bool {
        self.mutate(identity, 0, |s| {
            if s.metadata == metadata {
                return false;
            }
            s.metadata = metadata;
            true
        })
    }

    pub fn add_thread(&self, identity: &ProcessIdentity, tid: u32, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| s.threads.insert(tid))
    }

    pub fn remove_thread(&self, identity: &ProcessIdentity, tid: u32, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| s.threads.remove(&tid))
    }

    pub fn add_module(&self, identity: &ProcessIdentity, module: LoadedModule, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| {
            if s.modules.get(&module.path) == Some(&module) {
                return false;
            }
            s.modules.insert(module.path.clone(), module);
            true
        })
    }

    pub fn remove_module(&self, identity: &ProcessIdentity, path: &str, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| s.modules.remove(path).is_some())
    }

    /// 同一句柄值再次出现时以新的为准（关闭事件可能丢失）
    pub fn add_handle(&self, identity: &ProcessIdentity, handle: OpenHandle, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| {
            if s.handles.get(&handle.value) == Some(&handle) {
                return false;
            }
            s.handles.insert(handle.value, handle);
            true
        })
    }

    pub fn remove_handle(&self, identity: &ProcessIdentity, value: u64, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| s.handles.remove(&value).is_some())
    }

    pub fn add_region(&self, identity: &ProcessIdentity, region: MemoryRegion, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| {
            s.regions.insert(region.base_address, region) != Some(region)
        })
    }

    /// 未知基地址时为空操作（分配事件可能丢失）
    pub fn remove_region(&self, identity: &ProcessIdentity, base_address: u64, timestamp: u64) -> bool {
        self.mutate(identity, timestamp, |s| s.regions.remove(&base_address).is_some())
    }

    /// 完整刷新：用一次 OS 读取的结果替换所有资源
    pub fn refresh_resources(
        &self,
        identity: &ProcessIdentity,
        resources: ResourceSet,
        timestamp: u64,
    ) -> bool {
        let Some(mut snapshot) = self.snapshots.get_mut(identity) else {
            return false;
        };
        snapshot.replace_resources(resources);
        snapshot.refreshed_at = Some(timestamp);
        if timestamp > snapshot.last_updated {
            snapshot.last_updated = timestamp;
        }
        true
    }
}
