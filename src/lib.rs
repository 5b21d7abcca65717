//! 进程生命周期跟踪与规则执行
//!
//! 事件源（eBPF 或 procfs 轮询）把进程、线程、模块、句柄和内存区域的变化
//! 送进快照存储；评估器定期按规则目录检查每个进程并执行动作。

pub mod api;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
