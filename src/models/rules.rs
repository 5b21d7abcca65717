use serde::{Deserialize, Serialize};
use std::fmt;

/// 全局规则的目标名称
pub const GLOBAL_TARGET: &str = "*";

/// 进程优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityLevel {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl PriorityLevel {
    /// 对应的 nice 值
    pub fn nice_value(&self) -> i32 {
        match self {
            PriorityLevel::Idle => 19,
            PriorityLevel::BelowNormal => 10,
            PriorityLevel::Normal => 0,
            PriorityLevel::AboveNormal => -5,
            PriorityLevel::High => -10,
            PriorityLevel::RealTime => -20,
        }
    }
}

/// 规则触发后执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleAction {
    ChangeAffinity { mask: u64 },
    ChangePriority { level: PriorityLevel },
    EmptyWorkingSet,
    TerminateProcess,
}

impl RuleAction {
    /// 不可逆动作，在同一进程的多个动作中优先
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuleAction::TerminateProcess)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RuleAction::ChangeAffinity { .. } => "change_affinity",
            RuleAction::ChangePriority { .. } => "change_priority",
            RuleAction::EmptyWorkingSet => "empty_working_set",
            RuleAction::TerminateProcess => "terminate",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::ChangeAffinity { mask } => write!(f, "ChangeAffinity({:#x})", mask),
            RuleAction::ChangePriority { level } => write!(f, "ChangePriority({:?})", level),
            RuleAction::EmptyWorkingSet => write!(f, "EmptyWorkingSet"),
            RuleAction::TerminateProcess => write!(f, "TerminateProcess"),
        }
    }
}

fn default_notify() -> bool {
    true
}

/// CPU 使用率阈值规则（百分比）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuThresholdRule {
    pub target: String,
    pub threshold_percent: f32,
    pub action: RuleAction,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

/// 常驻内存阈值规则（字节）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryThresholdRule {
    pub target: String,
    pub threshold_bytes: u64,
    pub action: RuleAction,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

/// 实例数限制：同名进程的第 N 个实例（按创建时间）达到阈值时触发
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceLimit {
    pub target: String,
    pub threshold_instances: u32,
    pub action: RuleAction,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

/// 累计能耗规则（焦耳）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEnergyUsageRule {
    pub target: String,
    pub threshold_joules: f64,
    pub action: RuleAction,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Cpu,
    Memory,
    InstanceLimit,
    Energy,
}

/// 看门狗规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WatchdogRule {
    Cpu(CpuThresholdRule),
    Memory(MemoryThresholdRule),
    InstanceLimit(ProcessInstanceLimit),
    Energy(ProcessEnergyUsageRule),
}

impl WatchdogRule {
    pub fn kind(&self) -> RuleKind {
        match self {
            WatchdogRule::Cpu(_) => RuleKind::Cpu,
            WatchdogRule::Memory(_) => RuleKind::Memory,
            WatchdogRule::InstanceLimit(_) => RuleKind::InstanceLimit,
            WatchdogRule::Energy(_) => RuleKind::Energy,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            WatchdogRule::Cpu(r) => &r.target,
            WatchdogRule::Memory(r) => &r.target,
            WatchdogRule::InstanceLimit(r) => &r.target,
            WatchdogRule::Energy(r) => &r.target,
        }
    }

    pub fn action(&self) -> RuleAction {
        match self {
            WatchdogRule::Cpu(r) => r.action,
            WatchdogRule::Memory(r) => r.action,
            WatchdogRule::InstanceLimit(r) => r.action,
            WatchdogRule::Energy(r) => r.action,
        }
    }

    pub fn notify(&self) -> bool {
        match self {
            WatchdogRule::Cpu(r) => r.notify,
            WatchdogRule::Memory(r) => r.notify,
            WatchdogRule::InstanceLimit(r) => r.notify,
            WatchdogRule::Energy(r) => r.notify,
        }
    }

    /// 阈值的可读描述，用于告警消息
    pub fn describe_threshold(&self) -> String {
        match self {
            WatchdogRule::Cpu(r) => format!("{:.1}% CPU", r.threshold_percent),
            WatchdogRule::Memory(r) => format!("{} bytes", r.threshold_bytes),
            WatchdogRule::InstanceLimit(r) => format!("{} instances", r.threshold_instances),
            WatchdogRule::Energy(r) => format!("{:.1} J", r.threshold_joules),
        }
    }
}

/// 禁止运行的进程
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisallowedProcess {
    pub name: String,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

/// 永久保留的进程（免于终止）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermanentProcess {
    pub name: String,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

/// 进程启动时应用的默认 CPU 设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefaultCpuSettings {
    pub name: String,
    #[serde(default)]
    pub priority: Option<PriorityLevel>,
    #[serde(default)]
    pub affinity: Option<u64>,
}

impl ProcessDefaultCpuSettings {
    pub fn actions(&self) -> Vec<RuleAction> {
        let mut actions = Vec::new();
        if let Some(level) = self.priority {
            actions.push(RuleAction::ChangePriority { level });
        }
        if let Some(mask) = self.affinity {
            actions.push(RuleAction::ChangeAffinity { mask });
        }
        actions
    }
}

/// 规则目录的完整配置，持久化的单位
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub cpu_rules: Vec<CpuThresholdRule>,
    #[serde(default)]
    pub memory_rules: Vec<MemoryThresholdRule>,
    #[serde(default)]
    pub instance_limits: Vec<ProcessInstanceLimit>,
    #[serde(default)]
    pub energy_rules: Vec<ProcessEnergyUsageRule>,
    #[serde(default)]
    pub disallowed: Vec<DisallowedProcess>,
    #[serde(default)]
    pub permanent: Vec<PermanentProcess>,
    #[serde(default)]
    pub defaults: Vec<ProcessDefaultCpuSettings>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_shape() {
        let json = r#"{
            "kind": "Cpu",
            "target": "app.exe",
            "threshold_percent": 50.0,
            "action": { "type": "ChangePriority", "level": "BelowNormal" }
        }"#;
        let rule: WatchdogRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.kind(), RuleKind::Cpu);
        assert_eq!(rule.target(), "app.exe");
        assert!(rule.notify());
        assert_eq!(
            rule.action(),
            RuleAction::ChangePriority {
                level: PriorityLevel::BelowNormal
            }
        );
    }

    #[test]
    fn test_default_settings_actions() {
        let settings = ProcessDefaultCpuSettings {
            name: "game".into(),
            priority: Some(PriorityLevel::High),
            affinity: Some(0b11),
        };
        assert_eq!(
            settings.actions(),
            vec![
                RuleAction::ChangePriority {
                    level: PriorityLevel::High
                },
                RuleAction::ChangeAffinity { mask: 0b11 },
            ]
        );
    }

    #[test]
    fn test_only_terminate_is_terminal() {
        assert!(RuleAction::TerminateProcess.is_terminal());
        assert!(!RuleAction::EmptyWorkingSet.is_terminal());
        assert!(!RuleAction::ChangeAffinity { mask: 1 }.is_terminal());
    }
}
