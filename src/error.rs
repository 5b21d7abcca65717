use thiserror::Error;

use crate::models::ProcessIdentity;

/// 进程查询失败（通常是进程已经退出）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("process {0} not found")]
    NotFound(u32),

    #[error("process {0} no longer matches the tracked identity")]
    Stale(ProcessIdentity),

    #[error("failed to read process {pid}: {reason}")]
    Unreadable { pid: u32, reason: String },
}

impl LookupError {
    pub fn unreadable<S: Into<String>>(pid: u32, reason: S) -> Self {
        LookupError::Unreadable {
            pid,
            reason: reason.into(),
        }
    }
}

/// 特权操作失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("target process {0} is gone")]
    TargetGone(ProcessIdentity),

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("invalid action: {0}")]
    Invalid(String),

    #[error("action failed: {0}")]
    Failed(String),
}

/// 规则目录 CRUD 失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("entry already exists: {0}")]
    Duplicate(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("invalid entry: {0}")]
    Invalid(String),
}

impl CatalogError {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        CatalogError::Invalid(msg.into())
    }
}

/// 事件源启动失败
#[derive(Error, Debug)]
pub enum SourceError {
    /// 事件源无法初始化，调用方可以切换到轮询模式
    #[error("event source unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("event source failed: {0}")]
    Failed(String),
}

/// 规则持久化失败
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
