use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{ProcessIdentity, ProcessMetadata};

/// 已加载的模块（可执行映像 / 共享库）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadedModule {
    pub path: String,
    pub base_address: u64,
    pub size: u64,
}

/// 打开的句柄（Linux 上即文件描述符）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHandle {
    pub value: u64,
    #[serde(default)]
    pub handle_type: String,
    #[serde(default)]
    pub object_address: u64,
    #[serde(default)]
    pub name: String,
}

/// 虚拟内存区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub size: u64,
}

/// 一次完整刷新读到的资源集合
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    pub threads: Vec<u32>,
    pub modules: Vec<LoadedModule>,
    pub handles: Vec<OpenHandle>,
    pub regions: Vec<MemoryRegion>,
}

/// 单个进程当前已知的资源视图
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub identity: ProcessIdentity,
    pub metadata: ProcessMetadata,
    pub threads: BTreeSet<u32>,
    /// 按路径索引
    pub modules: HashMap<String, LoadedModule>,
    /// 按句柄值索引，同一快照内句柄值唯一
    pub handles: BTreeMap<u64, OpenHandle>,
    /// 按基地址索引
    pub regions: BTreeMap<u64, MemoryRegion>,
    /// 最后一次增量更新的时间（开机纳秒）
    pub last_updated: u64,
    /// 最后一次完整刷新的时间，未刷新过为 None
    pub refreshed_at: Option<u64>,
}

impl ProcessSnapshot {
    pub fn new(identity: ProcessIdentity, metadata: ProcessMetadata) -> Self {
        Self {
            identity,
            metadata,
            threads: BTreeSet::new(),
            modules: HashMap::new(),
            handles: BTreeMap::new(),
            regions: BTreeMap::new(),
            last_updated: identity.creation_time,
            refreshed_at: None,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// 已知内存区域的总大小
    pub fn committed_bytes(&self) -> u64 {
        self.regions.values().map(|r| r.size).sum()
    }

    pub(crate) fn replace_resources(&mut self, resources: ResourceSet) {
        self.threads = resources.threads.into_iter().collect();
        self.modules = resources
            .modules
            .into_iter()
            .map(|m| (m.path.clone(), m))
            .collect();
        self.handles = resources
            .handles
            .into_iter()
            .map(|h| (h.value, h))
            .collect();
        self.regions = resources
            .regions
            .into_iter()
            .map(|r| (r.base_address, r))
            .collect();
    }
}
