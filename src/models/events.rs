use serde::{Deserialize, Serialize};

use crate::models::ProcessIdentity;

/// 内核事件源推送的原始事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// 事件发生时间（开机纳秒），0 表示未知
    pub timestamp: u64,
    pub kind: EventKind,
}

impl RawEvent {
    pub fn new(timestamp: u64, kind: EventKind) -> Self {
        Self { timestamp, kind }
    }

    /// 不带时间戳的事件
    pub fn untimed(kind: EventKind) -> Self {
        Self { timestamp: 0, kind }
    }
}

/// 生命周期事件类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    ProcessStart {
        pid: u32,
        /// 事件源已知的创建时间；缺失时由身份解析器查询
        #[serde(default)]
        creation_time: Option<u64>,
        image_name: String,
        #[serde(default)]
        image_path: String,
        #[serde(default)]
        command_line: String,
    },
    ProcessStop {
        pid: u32,
    },
    ThreadStart {
        pid: u32,
        tid: u32,
    },
    ThreadStop {
        pid: u32,
        tid: u32,
    },
    ImageLoad {
        pid: u32,
        path: String,
        base: u64,
        size: u64,
    },
    ImageUnload {
        pid: u32,
        path: String,
    },
    HandleCreate {
        pid: Option<u32>,
        handle: u64,
        object: u64,
        name: String,
    },
    HandleClose {
        pid: Option<u32>,
        handle: u64,
    },
    HandleDuplicate {
        source_pid: u32,
        target_pid: u32,
        handle: u64,
        object: u64,
        name: String,
    },
    VirtualAlloc {
        pid: u32,
        base: u64,
        size: u64,
    },
    VirtualFree {
        pid: u32,
        base: u64,
    },
}

impl EventKind {
    /// 指标标签用的短名称
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::ProcessStart { .. } => "process_start",
            EventKind::ProcessStop { .. } => "process_stop",
            EventKind::ThreadStart { .. } => "thread_start",
            EventKind::ThreadStop { .. } => "thread_stop",
            EventKind::ImageLoad { .. } => "image_load",
            EventKind::ImageUnload { .. } => "image_unload",
            EventKind::HandleCreate { .. } => "handle_create",
            EventKind::HandleClose { .. } => "handle_close",
            EventKind::HandleDuplicate { .. } => "handle_duplicate",
            EventKind::VirtualAlloc { .. } => "virtual_alloc",
            EventKind::VirtualFree { .. } => "virtual_free",
        }
    }
}

/// 快照存储发生的变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreChange {
    pub identity: ProcessIdentity,
    pub change: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum ChangeKind {
    ProcessAdded,
    ProcessRemoved,
    MetadataChanged,
    ThreadAdded(u32),
    ThreadRemoved(u32),
    ModuleLoaded(String),
    ModuleUnloaded(String),
    HandleOpened(u64),
    HandleClosed(u64),
    RegionAllocated(u64),
    RegionFreed(u64),
    Refreshed,
}
