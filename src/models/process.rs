use serde::{Deserialize, Serialize};
use std::fmt;

/// 进程身份：pid + 创建时间
///
/// 创建时间为开机以来的纳秒数（CLOCK_BOOTTIME），pid 相同但创建时间不同
/// 的两个进程是不同的实体（pid 复用）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub creation_time: u64,
}

impl ProcessIdentity {
    pub fn new(pid: u32, creation_time: u64) -> Self {
        Self { pid, creation_time }
    }

    /// 事件时间戳是否属于这个进程实例（早于创建时间的事件属于之前的实例）
    ///
    /// 时间戳为 0 表示事件源没有提供时间，视为匹配。
    pub fn owns_timestamp(&self, timestamp: u64) -> bool {
        timestamp == 0 || timestamp >= self.creation_time
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.creation_time)
    }
}

/// 名称比较统一用的规范形式（Unicode 小写）
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
}

/// 两个名称规范化后是否相同
pub fn same_name(a: &str, b: &str) -> bool {
    a == b || normalize_name(a) == normalize_name(b)
}

/// 进程元信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    /// 进程名称（规则按名称匹配）
    pub name: String,
    /// 可执行文件路径
    #[serde(default)]
    pub image_path: String,
    /// 命令行
    #[serde(default)]
    pub command_line: String,
}

impl ProcessMetadata {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 规则匹配使用的规范化名称
    pub fn match_key(&self) -> String {
        normalize_name(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owns_timestamp() {
        let identity = ProcessIdentity::new(100, 5_000);
        assert!(identity.owns_timestamp(5_000));
        assert!(identity.owns_timestamp(9_000));
        assert!(identity.owns_timestamp(0));
        assert!(!identity.owns_timestamp(4_999));
    }

    #[test]
    fn test_same_pid_different_creation_is_distinct() {
        let first = ProcessIdentity::new(100, 1);
        let second = ProcessIdentity::new(100, 2);
        assert_ne!(first, second);
        assert_eq!(first.to_string(), "100@1");
    }
}
