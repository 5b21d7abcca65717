//! 规则目录
//!
//! 写操作复制当前配置、修改后整体替换（copy-on-write），评估轮次持有的
//! `CatalogSnapshot` 不受并发 CRUD 影响。

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::CatalogError;
use crate::models::{
    normalize_name, same_name, CatalogConfig, DisallowedProcess, PermanentProcess, ProcessDefaultCpuSettings, RuleAction,
    RuleKind, WatchdogRule,
};
use crate::services::name_matcher::NamePattern;

/// 某一时刻的完整规则目录（只读）
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    config: Arc<CatalogConfig>,
    rules: Arc<Vec<(NamePattern, WatchdogRule)>>,
}

impl CatalogSnapshot {
    fn build(config: CatalogConfig) -> Self {
        let rules = all_rules(&config)
            .into_iter()
            .map(|rule| (NamePattern::parse(rule.target()), rule))
            .collect();
        Self {
            config: Arc::new(config),
            rules: Arc::new(rules),
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// 对该进程名生效的所有规则：精确名称在前，其次通配，最后全局
    pub fn rules_for(&self, name: &str) -> Vec<&WatchdogRule> {
        let mut matched: Vec<(u8, &WatchdogRule)> = self
            .rules
            .iter()
            .filter(|(pattern, _)| pattern.matches(name))
            .map(|(pattern, rule)| (pattern.specificity(), rule))
            .collect();
        matched.sort_by_key(|(specificity, _)| *specificity);
        matched.into_iter().map(|(_, rule)| rule).collect()
    }

    pub fn disallowed(&self, name: &str) -> Option<&DisallowedProcess> {
        self.config
            .disallowed
            .iter()
            .find(|entry| same_name(&entry.name, name))
    }

    pub fn permanent(&self, name: &str) -> Option<&PermanentProcess> {
        self.config
            .permanent
            .iter()
            .find(|entry| same_name(&entry.name, name))
    }

    pub fn defaults_for(&self, name: &str) -> Option<&ProcessDefaultCpuSettings> {
        self.config
            .defaults
            .iter()
            .find(|entry| same_name(&entry.name, name))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn all_rules(config: &CatalogConfig) -> Vec<WatchdogRule> {
    let mut rules = Vec::new();
    rules.extend(config.cpu_rules.iter().cloned().map(WatchdogRule::Cpu));
    rules.extend(config.memory_rules.iter().cloned().map(WatchdogRule::Memory));
    rules.extend(config.instance_limits.iter().cloned().map(WatchdogRule::InstanceLimit));
    rules.extend(config.energy_rules.iter().cloned().map(WatchdogRule::Energy));
    rules
}

/// 规则相等：目标名称忽略大小写，其余字段逐一比较
fn same_rule(a: &WatchdogRule, b: &WatchdogRule) -> bool {
    match (a, b) {
        (WatchdogRule::Cpu(x), WatchdogRule::Cpu(y)) => {
            same_name(&x.target, &y.target)
                && x.threshold_percent == y.threshold_percent
                && x.action == y.action
                && x.notify == y.notify
        }
        (WatchdogRule::Memory(x), WatchdogRule::Memory(y)) => {
            same_name(&x.target, &y.target)
                && x.threshold_bytes == y.threshold_bytes
                && x.action == y.action
                && x.notify == y.notify
        }
        (WatchdogRule::InstanceLimit(x), WatchdogRule::InstanceLimit(y)) => {
            same_name(&x.target, &y.target)
                && x.threshold_instances == y.threshold_instances
                && x.action == y.action
                && x.notify == y.notify
        }
        (WatchdogRule::Energy(x), WatchdogRule::Energy(y)) => {
            same_name(&x.target, &y.target)
                && x.threshold_joules == y.threshold_joules
                && x.action == y.action
                && x.notify == y.notify
        }
        _ => false,
    }
}

fn validate_action(action: &RuleAction) -> Result<(), CatalogError> {
    match action {
        RuleAction::ChangeAffinity { mask: 0 } => Err(CatalogError::invalid("affinity mask must not be empty")),
        _ => Ok(()),
    }
}

fn validate_name(name: &str) -> Result<(), CatalogError> {
    if name.trim().is_empty() {
        return Err(CatalogError::invalid("process name must not be empty"));
    }
    Ok(())
}

fn validate_rule(rule: &WatchdogRule) -> Result<(), CatalogError> {
    validate_name(rule.target())?;
    validate_action(&rule.action())?;

    match rule {
        WatchdogRule::Cpu(r) => {
            if !r.threshold_percent.is_finite() || r.threshold_percent <= 0.0 || r.threshold_percent > 100.0 {
                return Err(CatalogError::invalid(format!(
                    "CPU threshold must be within (0, 100], got {}",
                    r.threshold_percent
                )));
            }
        }
        WatchdogRule::Memory(r) => {
            if r.threshold_bytes == 0 {
                return Err(CatalogError::invalid("memory threshold must be positive"));
            }
        }
        WatchdogRule::InstanceLimit(r) => {
            if r.threshold_instances == 0 {
                return Err(CatalogError::invalid("instance threshold must be at least 1"));
            }
        }
        WatchdogRule::Energy(r) => {
            if !r.threshold_joules.is_finite() || r.threshold_joules <= 0.0 {
                return Err(CatalogError::invalid(format!(
                    "energy threshold must be positive, got {}",
                    r.threshold_joules
                )));
            }
        }
    }
    Ok(())
}

fn validate_defaults(settings: &ProcessDefaultCpuSettings) -> Result<(), CatalogError> {
    validate_name(&settings.name)?;
    if settings.priority.is_none() && settings.affinity.is_none() {
        return Err(CatalogError::invalid("default settings need a priority or an affinity"));
    }
    if settings.affinity == Some(0) {
        return Err(CatalogError::invalid("affinity mask must not be empty"));
    }
    Ok(())
}

fn validate_config(config: &CatalogConfig) -> Result<(), CatalogError> {
    let rules = all_rules(config);
    for (i, rule) in rules.iter().enumerate() {
        validate_rule(rule)?;
        if rules[..i].iter().any(|other| same_rule(other, rule)) {
            return Err(CatalogError::Duplicate(format!("{} rule for {}", rule_kind_name(rule.kind()), rule.target())));
        }
    }

    let names = config
        .disallowed
        .iter()
        .map(|e| ("disallowed", e.name.as_str()))
        .chain(config.permanent.iter().map(|e| ("permanent", e.name.as_str())))
        .chain(config.defaults.iter().map(|e| ("defaults", e.name.as_str())));
    let mut seen: Vec<(&str, String)> = Vec::new();
    for (list, name) in names {
        validate_name(name)?;
        let key = (list, normalize_name(name));
        if seen.contains(&key) {
            return Err(CatalogError::Duplicate(format!("{} entry {}", list, name)));
        }
        seen.push(key);
    }

    for settings in &config.defaults {
        validate_defaults(settings)?;
    }
    Ok(())
}

fn rule_kind_name(kind: RuleKind) -> &'static str {
    match kind {
        RuleKind::Cpu => "cpu",
        RuleKind::Memory => "memory",
        RuleKind::InstanceLimit => "instance limit",
        RuleKind::Energy => "energy",
    }
}

pub struct RuleCatalog {
    current: RwLock<CatalogSnapshot>,
}

impl RuleCatalog {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(CatalogSnapshot::build(CatalogConfig::default())),
        }
    }

    pub fn from_config(config: CatalogConfig) -> Result<Self, CatalogError> {
        validate_config(&config)?;
        Ok(Self {
            current: RwLock::new(CatalogSnapshot::build(config)),
        })
    }

    /// 评估轮次使用的快照
    pub fn snapshot(&self) -> CatalogSnapshot {
        self.current.read().clone()
    }

    pub fn export(&self) -> CatalogConfig {
        self.current.read().config().clone()
    }

    /// 整体替换目录内容，校验失败时保持原状
    pub fn import(&self, config: CatalogConfig) -> Result<(), CatalogError> {
        validate_config(&config)?;
        *self.current.write() = CatalogSnapshot::build(config);
        Ok(())
    }

    /// 在写锁内复制、修改并替换配置
    fn update<F>(&self, f: F) -> Result<(), CatalogError>
    where
        F: FnOnce(&mut CatalogConfig) -> Result<(), CatalogError>,
    {
        let mut current = self.current.write();
        let mut config = current.config().clone();
        f(&mut config)?;
        *current = CatalogSnapshot::build(config);
        Ok(())
    }

    pub fn add_rule(&self, rule: WatchdogRule) -> Result<(), CatalogError> {
        validate_rule(&rule)?;
        self.update(|config| {
            if all_rules(config).iter().any(|existing| same_rule(existing, &rule)) {
                return Err(CatalogError::Duplicate(format!(
                    "{} rule for {}",
                    rule_kind_name(rule.kind()),
                    rule.target()
                )));
            }
            match rule {
                WatchdogRule::Cpu(r) => config.cpu_rules.push(r),
                WatchdogRule::Memory(r) => config.memory_rules.push(r),
                WatchdogRule::InstanceLimit(r) => config.instance_limits.push(r),
                WatchdogRule::Energy(r) => config.energy_rules.push(r),
            }
            Ok(())
        })
    }

    pub fn remove_rule(&self, rule: &WatchdogRule) -> Result<(), CatalogError> {
        self.update(|config| {
            let removed = match rule {
                WatchdogRule::Cpu(_) => remove_matching(&mut config.cpu_rules, |r| {
                    same_rule(&WatchdogRule::Cpu(r.clone()), rule)
                }),
                WatchdogRule::Memory(_) => remove_matching(&mut config.memory_rules, |r| {
                    same_rule(&WatchdogRule::Memory(r.clone()), rule)
                }),
                WatchdogRule::InstanceLimit(_) => remove_matching(&mut config.instance_limits, |r| {
                    same_rule(&WatchdogRule::InstanceLimit(r.clone()), rule)
                }),
                WatchdogRule::Energy(_) => remove_matching(&mut config.energy_rules, |r| {
                    same_rule(&WatchdogRule::Energy(r.clone()), rule)
                }),
            };
            if removed {
                Ok(())
            } else {
                Err(CatalogError::NotFound(format!(
                    "{} rule for {}",
                    rule_kind_name(rule.kind()),
                    rule.target()
                )))
            }
        })
    }

    /// 指定种类的规则；`None` 返回全部
    pub fn list_rules(&self, kind: Option<RuleKind>) -> Vec<WatchdogRule> {
        all_rules(self.current.read().config())
            .into_iter()
            .filter(|rule| kind.map_or(true, |k| rule.kind() == k))
            .collect()
    }

    pub fn add_disallowed(&self, entry: DisallowedProcess) -> Result<(), CatalogError> {
        validate_name(&entry.name)?;
        self.update(|config| {
            if config.disallowed.iter().any(|e| same_name(&e.name, &entry.name)) {
                return Err(CatalogError::Duplicate(format!("disallowed entry {}", entry.name)));
            }
            config.disallowed.push(entry);
            Ok(())
        })
    }

    pub fn remove_disallowed(&self, name: &str) -> Result<(), CatalogError> {
        self.update(|config| {
            if remove_matching(&mut config.disallowed, |e| same_name(&e.name, name)) {
                Ok(())
            } else {
                Err(CatalogError::NotFound(format!("disallowed entry {}", name)))
            }
        })
    }

    pub fn list_disallowed(&self) -> Vec<DisallowedProcess> {
        self.current.read().config().disallowed.clone()
    }

    pub fn add_permanent(&self, entry: PermanentProcess) -> Result<(), CatalogError> {
        validate_name(&entry.name)?;
        self.update(|config| {
            if config.permanent.iter().any(|e| same_name(&e.name, &entry.name)) {
                return Err(CatalogError::Duplicate(format!("permanent entry {}", entry.name)));
            }
            config.permanent.push(entry);
            Ok(())
        })
    }

    pub fn remove_permanent(&self, name: &str) -> Result<(), CatalogError> {
        self.update(|config| {
            if remove_matching(&mut config.permanent, |e| same_name(&e.name, name)) {
                Ok(())
            } else {
                Err(CatalogError::NotFound(format!("permanent entry {}", name)))
            }
        })
    }

    pub fn list_permanent(&self) -> Vec<PermanentProcess> {
        self.current.read().config().permanent.clone()
    }

    pub fn add_defaults(&self, settings: ProcessDefaultCpuSettings) -> Result<(), CatalogError> {
        validate_defaults(&settings)?;
        self.update(|config| {
            if config.defaults.iter().any(|e| same_name(&e.name, &settings.name)) {
                return Err(CatalogError::Duplicate(format!("default settings for {}", settings.name)));
            }
            config.defaults.push(settings);
            Ok(())
        })
    }

    pub fn remove_defaults(&self, name: &str) -> Result<(), CatalogError> {
        self.update(|config| {
            if remove_matching(&mut config.defaults, |e| same_name(&e.name, name)) {
                Ok(())
            } else {
                Err(CatalogError::NotFound(format!("default settings for {}", name)))
            }
        })
    }

    pub fn list_defaults(&self) -> Vec<ProcessDefaultCpuSettings> {
        self.current.read().config().defaults.clone()
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// 删除第一个匹配项
fn remove_matching<T, F>(items: &mut Vec<T>, pred: F) -> bool
where
    F: Fn(&T) -> bool,
{
    match items.iter().position(pred) {
        Some(index) => {
            items.remove(index);
            true
        }
        None => false,
    }
}
