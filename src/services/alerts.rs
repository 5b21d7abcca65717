use log::warn;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::metrics::METRICS;
use crate::models::ProcessIdentity;

pub const DEFAULT_ALERT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// 阈值规则触发
    RuleViolation,
    /// 禁止运行的进程被发现
    DisallowedProcess,
    /// 禁止运行但在永久列表中，终止被抑制
    PermanentProcess,
    /// 动作执行失败
    ActionFailed,
}

impl AlertKind {
    pub fn label(&self) -> &'static str {
        match self {
            AlertKind::RuleViolation => "rule_violation",
            AlertKind::DisallowedProcess => "disallowed_process",
            AlertKind::PermanentProcess => "permanent_process",
            AlertKind::ActionFailed => "action_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: u64,
    /// Unix 毫秒
    pub timestamp_ms: u64,
    pub kind: AlertKind,
    pub identity: ProcessIdentity,
    pub process_name: String,
    pub message: String,
}

/// 面向用户的通知出口
pub trait AlertSink: Send + Sync {
    fn raise(&self, kind: AlertKind, identity: ProcessIdentity, process_name: &str, message: String);
}

/// 有界的内存告警日志，超出容量时丢弃最旧的
pub struct AlertLog {
    entries: Mutex<VecDeque<Alert>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_ALERT_CAPACITY))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// 最近的告警，新的在前
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

impl AlertSink for AlertLog {
    fn raise(&self, kind: AlertKind, identity: ProcessIdentity, process_name: &str, message: String) {
        warn!("[{}] {} ({}): {}", kind.label(), process_name, identity, message);
        METRICS.alerts_total.with_label_values(&[kind.label()]).inc();

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let alert = Alert {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp_ms,
            kind,
            identity,
            process_name: process_name.to_string(),
            message,
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }
}
