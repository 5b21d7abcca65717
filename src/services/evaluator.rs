//! 策略评估与执行
//!
//! 每轮：取规则快照，刷新采样，重新确认每个被跟踪进程的身份，然后逐个进程
//! 评估。单个进程的失败（指标不可读、动作失败）不影响本轮其它进程。

use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::METRICS;
use crate::models::{
    normalize_name, ProcessIdentity, ProcessMetadata, ProcessStats, RuleAction, WatchdogRule,
};
use crate::services::alerts::{AlertKind, AlertSink};
use crate::services::executor::ActionExecutor;
use crate::services::identity::IdentityResolver;
use crate::services::rule_catalog::{CatalogSnapshot, RuleCatalog};
use crate::services::snapshot_store::SnapshotStore;
use crate::services::stats_collector::MetricSampler;

/// 一轮评估的结果汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub evaluated: usize,
    /// 身份已失效（退出或 pid 被复用）
    pub skipped_stale: usize,
    /// 指标不可读
    pub skipped_unavailable: usize,
    pub defaults_applied: usize,
    pub actions_applied: usize,
    pub action_failures: usize,
    pub alerts_raised: usize,
}

/// 通知抑制：同一 (进程, 规则) 在持续违规期间只告警一次
#[derive(Debug, Default)]
pub struct SuppressionTracker {
    active: HashMap<ProcessIdentity, HashSet<String>>,
}

impl SuppressionTracker {
    /// 记录本轮仍在违规的规则，返回新出现的违规；不再违规的规则重新启用告警
    pub fn observe(&mut self, identity: ProcessIdentity, violated: &[String]) -> Vec<String> {
        let current: HashSet<String> = violated.iter().cloned().collect();
        let previous = self.active.remove(&identity).unwrap_or_default();
        let fresh = violated
            .iter()
            .filter(|key| !previous.contains(*key))
            .cloned()
            .collect();
        if !current.is_empty() {
            self.active.insert(identity, current);
        }
        fresh
    }

    pub fn is_suppressed(&self, identity: &ProcessIdentity, key: &str) -> bool {
        self.active
            .get(identity)
            .map_or(false, |keys| keys.contains(key))
    }

    /// 进程消失时清理
    pub fn retain(&mut self, live: &HashSet<ProcessIdentity>) {
        self.active.retain(|identity, _| live.contains(identity));
    }
}

/// 本轮触发的一项
struct Trigger {
    key: String,
    kind: AlertKind,
    action: Option<RuleAction>,
    notify: bool,
    message: String,
}

#[derive(Default)]
struct EvaluatorState {
    /// 已经处理过“启动时一次性”逻辑的进程
    seen: HashSet<ProcessIdentity>,
    suppression: SuppressionTracker,
}

pub struct PolicyEvaluator {
    store: Arc<SnapshotStore>,
    catalog: Arc<RuleCatalog>,
    resolver: Arc<dyn IdentityResolver>,
    sampler: Arc<dyn MetricSampler>,
    executor: Arc<dyn ActionExecutor>,
    alerts: Arc<dyn AlertSink>,
    state: Mutex<EvaluatorState>,
    last_report: Mutex<Option<PassReport>>,
}

impl PolicyEvaluator {
    pub fn new(
        store: Arc<SnapshotStore>,
        catalog: Arc<RuleCatalog>,
        resolver: Arc<dyn IdentityResolver>,
        sampler: Arc<dyn MetricSampler>,
        executor: Arc<dyn ActionExecutor>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            catalog,
            resolver,
            sampler,
            executor,
            alerts,
            state: Mutex::new(EvaluatorState::default()),
            last_report: Mutex::new(None),
        }
    }

    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report.lock().clone()
    }

    /// 执行一轮评估
    pub fn run_pass(&self) -> PassReport {
        let started = Instant::now();
        let catalog = self.catalog.snapshot();
        self.sampler.refresh();

        let mut report = PassReport::default();
        let mut state = self.state.lock();

        let mut live: Vec<(ProcessIdentity, ProcessMetadata)> = Vec::new();
        for identity in self.store.identities() {
            if let Err(e) = self.resolver.revalidate(&identity) {
                debug!("Skipping {}: {}", identity, e);
                report.skipped_stale += 1;
                continue;
            }
            if let Some(metadata) = self.store.metadata(&identity) {
                live.push((identity, metadata));
            }
        }

        let live_set: HashSet<ProcessIdentity> = live.iter().map(|(id, _)| *id).collect();
        state.seen.retain(|id| live_set.contains(id));
        state.suppression.retain(&live_set);

        let ranks = instance_ranks(&live);

        for (identity, metadata) in &live {
            let newcomer = state.seen.insert(*identity);
            let rank = ranks.get(identity).copied().unwrap_or(1);
            self.evaluate_process(&catalog, &mut state, *identity, metadata, newcomer, rank, &mut report);
        }
        drop(state);

        METRICS.evaluation_passes.inc();
        METRICS.evaluation_pass_seconds.observe(started.elapsed().as_secs_f64());
        METRICS.tracked_processes.set(self.store.len() as i64);

        if report.actions_applied > 0 || report.action_failures > 0 {
            info!(
                "Evaluation pass: {} processes, {} actions applied, {} failed",
                report.evaluated, report.actions_applied, report.action_failures
            );
        }
        *self.last_report.lock() = Some(report.clone());
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_process(
        &self,
        catalog: &CatalogSnapshot,
        state: &mut EvaluatorState,
        identity: ProcessIdentity,
        metadata: &ProcessMetadata,
        newcomer: bool,
        rank: u32,
        report: &mut PassReport,
    ) {
        let name = metadata.name.as_str();

        // 启动时的默认 CPU 设置只应用一次
        if newcomer {
            if let Some(defaults) = catalog.defaults_for(name) {
                for action in defaults.actions() {
                    self.execute(identity, name, action, report);
                }
                report.defaults_applied += 1;
            }
        }

        let permanent = catalog.permanent(name);
        let mut triggers: Vec<Trigger> = Vec::new();

        if let Some(disallowed) = catalog.disallowed(name) {
            match permanent {
                Some(entry) => triggers.push(Trigger {
                    key: format!("permanent:{}", normalize_name(&entry.name)),
                    kind: AlertKind::PermanentProcess,
                    action: None,
                    notify: entry.notify,
                    message: "disallowed process is permanent; termination suppressed".to_string(),
                }),
                None => triggers.push(Trigger {
                    key: format!("disallowed:{}", normalize_name(&disallowed.name)),
                    kind: AlertKind::DisallowedProcess,
                    action: Some(RuleAction::TerminateProcess),
                    notify: disallowed.notify,
                    message: "disallowed process is running".to_string(),
                }),
            }
        }

        let mut stats: Option<ProcessStats> = None;
        let mut unavailable = false;
        // 指标不可读时仍处于抑制期的规则，保持抑制状态
        let mut carried: Vec<String> = Vec::new();
        for rule in catalog.rules_for(name) {
            let violated = match rule {
                // 实例数只在进程首次出现时评估
                WatchdogRule::InstanceLimit(limit) => newcomer && rank >= limit.threshold_instances,
                WatchdogRule::Cpu(_) | WatchdogRule::Memory(_) | WatchdogRule::Energy(_) => {
                    if stats.is_none() && !unavailable {
                        match self.sampler.sample(&identity) {
                            Ok(sampled) => stats = Some(sampled),
                            Err(e) => {
                                debug!("Metrics unavailable for {} ({}): {}", name, identity, e);
                                unavailable = true;
                            }
                        }
                    }
                    match stats.as_ref() {
                        Some(sampled) => exceeds(rule, sampled),
                        None => {
                            let key = rule_key(rule);
                            if state.suppression.is_suppressed(&identity, &key) {
                                carried.push(key);
                            }
                            false
                        }
                    }
                }
            };
            if violated {
                triggers.push(Trigger {
                    key: rule_key(rule),
                    kind: AlertKind::RuleViolation,
                    action: Some(rule.action()),
                    notify: rule.notify(),
                    message: format!(
                        "reached {} ({} rule on {:?}), action {}",
                        rule.describe_threshold(),
                        kind_label(rule),
                        rule.target(),
                        rule.action()
                    ),
                });
            }
        }

        // 资源类规则本轮跳过，其余触发项照常执行
        if unavailable {
            report.skipped_unavailable += 1;
        } else {
            report.evaluated += 1;
        }

        let mut keys: Vec<String> = triggers.iter().map(|t| t.key.clone()).collect();
        keys.extend(carried);
        let fresh = state.suppression.observe(identity, &keys);
        for trigger in &triggers {
            if trigger.notify && fresh.contains(&trigger.key) {
                self.alerts.raise(trigger.kind, identity, name, trigger.message.clone());
                report.alerts_raised += 1;
            }
        }

        let actions = resolve_actions(
            triggers.iter().filter_map(|t| t.action),
            permanent.is_some(),
        );
        for action in actions {
            self.execute(identity, name, action, report);
        }
    }

    fn execute(&self, identity: ProcessIdentity, name: &str, action: RuleAction, report: &mut PassReport) {
        match self.executor.apply(&identity, &action) {
            Ok(()) => {
                debug!("Applied {} to {} ({})", action, name, identity);
                METRICS.record_action(action.label(), true);
                report.actions_applied += 1;
            }
            Err(e) => {
                METRICS.record_action(action.label(), false);
                report.action_failures += 1;
                self.alerts.raise(
                    AlertKind::ActionFailed,
                    identity,
                    name,
                    format!("{} failed: {}", action, e),
                );
                report.alerts_raised += 1;
            }
        }
    }
}

/// 资源类规则：达到或超过阈值即违规
fn exceeds(rule: &WatchdogRule, stats: &ProcessStats) -> bool {
    match rule {
        WatchdogRule::Cpu(r) => stats.cpu_usage >= r.threshold_percent,
        WatchdogRule::Memory(r) => stats.memory_bytes >= r.threshold_bytes,
        WatchdogRule::Energy(r) => stats.energy_joules >= r.threshold_joules,
        WatchdogRule::InstanceLimit(_) => false,
    }
}

fn kind_label(rule: &WatchdogRule) -> &'static str {
    match rule {
        WatchdogRule::Cpu(_) => "cpu",
        WatchdogRule::Memory(_) => "memory",
        WatchdogRule::InstanceLimit(_) => "instance limit",
        WatchdogRule::Energy(_) => "energy",
    }
}

/// 抑制状态的规则键
fn rule_key(rule: &WatchdogRule) -> String {
    format!("rule:{:?}", rule)
}

/// 终止优先；否则应用所有不同的非终止动作。永久进程不会收到终止
fn resolve_actions<I>(actions: I, permanent: bool) -> Vec<RuleAction>
where
    I: Iterator<Item = RuleAction>,
{
    let mut resolved: Vec<RuleAction> = Vec::new();
    for action in actions {
        if action.is_terminal() && permanent {
            continue;
        }
        if action.is_terminal() {
            return vec![action];
        }
        if !resolved.contains(&action) {
            resolved.push(action);
        }
    }
    resolved
}

/// 同名进程按创建时间排序后的序号（从 1 开始）
fn instance_ranks(live: &[(ProcessIdentity, ProcessMetadata)]) -> HashMap<ProcessIdentity, u32> {
    let mut groups: HashMap<String, Vec<ProcessIdentity>> = HashMap::new();
    for (identity, metadata) in live {
        groups.entry(metadata.match_key()).or_default().push(*identity);
    }

    let mut ranks = HashMap::new();
    for mut members in groups.into_values() {
        members.sort_by_key(|id| (id.creation_time, id.pid));
        for (index, identity) in members.into_iter().enumerate() {
            ranks.insert(identity, index as u32 + 1);
        }
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;
    use crate::models::{
        CpuThresholdRule, DisallowedProcess, MemoryThresholdRule, PermanentProcess, PriorityLevel,
        ProcessDefaultCpuSettings, ProcessInstanceLimit,
    };
    use crate::services::alerts::AlertLog;
    use crate::testing::{FakeResolver, FakeSampler, RecordingExecutor};

    struct Fixture {
        store: Arc<SnapshotStore>,
        catalog: Arc<RuleCatalog>,
        resolver: Arc<FakeResolver>,
        sampler: Arc<FakeSampler>,
        executor: Arc<RecordingExecutor>,
        alerts: Arc<AlertLog>,
        evaluator: PolicyEvaluator,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(SnapshotStore::new());
            let catalog = Arc::new(RuleCatalog::new());
            let resolver = Arc::new(FakeResolver::new());
            let sampler = Arc::new(FakeSampler::new());
            let executor = Arc::new(RecordingExecutor::new());
            let alerts = Arc::new(AlertLog::default());
            let evaluator = PolicyEvaluator::new(
                store.clone(),
                catalog.clone(),
                resolver.clone(),
                sampler.clone(),
                executor.clone(),
                alerts.clone(),
            );
            Self {
                store,
                catalog,
                resolver,
                sampler,
                executor,
                alerts,
                evaluator,
            }
        }

        fn spawn(&self, pid: u32, created: u64, name: &str, cpu: f32) -> ProcessIdentity {
            let identity = ProcessIdentity::new(pid, created);
            self.resolver.set(pid, created);
            self.store.add_process(identity, ProcessMetadata::new(name));
            self.sampler.set(
                identity,
                ProcessStats {
                    cpu_usage: cpu,
                    memory_bytes: 1 << 20,
                    ..Default::default()
                },
            );
            identity
        }
    }

    fn cpu_rule(target: &str, threshold: f32, action: RuleAction, notify: bool) -> WatchdogRule {
        WatchdogRule::Cpu(CpuThresholdRule {
            target: target.into(),
            threshold_percent: threshold,
            action,
            notify,
        })
    }

    const LOW: RuleAction = RuleAction::ChangePriority {
        level: PriorityLevel::Idle,
    };

    #[test]
    fn test_cpu_rule_applies_once_per_pass() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app.exe", 80.0);
        f.catalog.add_rule(cpu_rule("app.exe", 50.0, LOW, true)).unwrap();

        let report = f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&app), vec![LOW]);
        assert_eq!(report.actions_applied, 1);

        f.executor.clear();
        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&app), vec![LOW]);
    }

    #[test]
    fn test_below_threshold_does_nothing() {
        let f = Fixture::new();
        f.spawn(10, 100, "app.exe", 20.0);
        f.catalog.add_rule(cpu_rule("app.exe", 50.0, LOW, true)).unwrap();

        f.evaluator.run_pass();
        assert!(f.executor.calls().is_empty());
        assert!(f.alerts.is_empty());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app.exe", 50.0);
        f.catalog.add_rule(cpu_rule("app.exe", 50.0, LOW, true)).unwrap();

        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&app).len(), 1);
    }

    #[test]
    fn test_terminate_dominates() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app.exe", 80.0);
        f.catalog
            .add_rule(cpu_rule("app.exe", 50.0, RuleAction::ChangeAffinity { mask: 1 }, true))
            .unwrap();
        f.catalog
            .add_rule(WatchdogRule::Memory(MemoryThresholdRule {
                target: "app.exe".into(),
                threshold_bytes: 1024,
                action: RuleAction::TerminateProcess,
                notify: true,
            }))
            .unwrap();

        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&app), vec![RuleAction::TerminateProcess]);
    }

    #[test]
    fn test_non_terminating_actions_all_applied_once() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app.exe", 80.0);
        f.catalog.add_rule(cpu_rule("app.exe", 50.0, LOW, true)).unwrap();
        f.catalog.add_rule(cpu_rule("app*", 60.0, LOW, true)).unwrap();
        f.catalog
            .add_rule(cpu_rule("*", 70.0, RuleAction::EmptyWorkingSet, true))
            .unwrap();

        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&app), vec![LOW, RuleAction::EmptyWorkingSet]);
    }

    #[test]
    fn test_disallowed_is_terminated() {
        let f = Fixture::new();
        let miner = f.spawn(20, 100, "miner", 0.0);
        f.catalog
            .add_disallowed(DisallowedProcess { name: "miner".into(), notify: true })
            .unwrap();

        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&miner), vec![RuleAction::TerminateProcess]);
        assert_eq!(f.alerts.recent(1)[0].kind, AlertKind::DisallowedProcess);
    }

    #[test]
    fn test_permanent_wins_over_disallowed() {
        let f = Fixture::new();
        let svc = f.spawn(20, 100, "svc", 90.0);
        f.catalog
            .add_disallowed(DisallowedProcess { name: "svc".into(), notify: true })
            .unwrap();
        f.catalog
            .add_permanent(PermanentProcess { name: "svc".into(), notify: false })
            .unwrap();
        f.catalog
            .add_rule(cpu_rule("svc", 50.0, RuleAction::TerminateProcess, false))
            .unwrap();

        f.evaluator.run_pass();
        assert!(f.executor.calls_for(&svc).is_empty());
        // Permanent 的 notify=false 决定不告警
        assert!(f.alerts.is_empty());

    }

    #[test]
    fn test_permanent_notify_flag_governs_alert() {
        let f = Fixture::new();
        let svc = f.spawn(20, 100, "svc", 0.0);
        f.catalog
            .add_disallowed(DisallowedProcess { name: "svc".into(), notify: false })
            .unwrap();
        f.catalog
            .add_permanent(PermanentProcess { name: "svc".into(), notify: true })
            .unwrap();

        f.evaluator.run_pass();
        assert!(f.executor.calls_for(&svc).is_empty());
        let alerts = f.alerts.recent(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::PermanentProcess);
    }

    #[test]
    fn test_permanent_keeps_non_terminating_actions() {
        let f = Fixture::new();
        let svc = f.spawn(20, 100, "svc", 90.0);
        f.catalog
            .add_permanent(PermanentProcess { name: "svc".into(), notify: true })
            .unwrap();
        f.catalog
            .add_rule(cpu_rule("svc", 50.0, RuleAction::TerminateProcess, true))
            .unwrap();
        f.catalog.add_rule(cpu_rule("svc", 60.0, LOW, true)).unwrap();

        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&svc), vec![LOW]);
    }

    #[test]
    fn test_metric_unavailable_skips_only_that_process() {
        let f = Fixture::new();
        let a = f.spawn(10, 100, "app", 80.0);
        let b = f.spawn(11, 100, "app", 80.0);
        f.sampler.remove(&a);
        f.catalog.add_rule(cpu_rule("app", 50.0, LOW, true)).unwrap();

        let report = f.evaluator.run_pass();
        assert!(f.executor.calls_for(&a).is_empty());
        assert_eq!(f.executor.calls_for(&b), vec![LOW]);
        assert_eq!(report.skipped_unavailable, 1);
    }

    #[test]
    fn test_instance_limit_checked_without_first_sample() {
        let f = Fixture::new();
        let worker = f.spawn(10, 100, "worker", 1.0);
        // 进程在 refresh 之后才出现，首轮没有样本
        f.sampler.remove(&worker);
        f.catalog.add_rule(cpu_rule("worker", 99.0, LOW, true)).unwrap();
        f.catalog
            .add_rule(WatchdogRule::InstanceLimit(ProcessInstanceLimit {
                target: "worker".into(),
                threshold_instances: 1,
                action: RuleAction::TerminateProcess,
                notify: true,
            }))
            .unwrap();

        let report = f.evaluator.run_pass();
        assert_eq!(report.skipped_unavailable, 1);
        assert_eq!(f.executor.calls_for(&worker), vec![RuleAction::TerminateProcess]);

        f.sampler.set(worker, ProcessStats::default());
        for _ in 0..3 {
            f.evaluator.run_pass();
        }
        assert_eq!(f.executor.calls_for(&worker).len(), 1);
    }

    #[test]
    fn test_disallowed_terminated_when_metrics_unavailable() {
        let f = Fixture::new();
        let miner = f.spawn(10, 100, "miner", 0.0);
        f.sampler.remove(&miner);
        f.catalog
            .add_rule(WatchdogRule::Memory(MemoryThresholdRule {
                target: "*".into(),
                threshold_bytes: 1 << 30,
                action: RuleAction::EmptyWorkingSet,
                notify: true,
            }))
            .unwrap();
        f.catalog
            .add_disallowed(DisallowedProcess {
                name: "miner".into(),
                notify: true,
            })
            .unwrap();

        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&miner), vec![RuleAction::TerminateProcess]);
        let alerts = f.alerts.recent(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::DisallowedProcess);
    }

    #[test]
    fn test_missing_sample_keeps_alert_suppressed() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app", 80.0);
        f.catalog.add_rule(cpu_rule("app", 50.0, LOW, true)).unwrap();

        f.evaluator.run_pass();
        f.sampler.remove(&app);
        f.evaluator.run_pass();
        f.sampler.set(
            app,
            ProcessStats {
                cpu_usage: 80.0,
                ..Default::default()
            },
        );
        f.evaluator.run_pass();
        assert_eq!(f.alerts.len(), 1);
    }

    #[test]
    fn test_action_failure_does_not_stop_pass() {
        let f = Fixture::new();
        let a = f.spawn(10, 100, "app", 80.0);
        let b = f.spawn(11, 101, "app", 80.0);
        f.executor.fail_for(a, ActionError::PermissionDenied);
        f.catalog.add_rule(cpu_rule("app", 50.0, LOW, false)).unwrap();

        let report = f.evaluator.run_pass();
        assert_eq!(report.action_failures, 1);
        assert_eq!(report.actions_applied, 1);
        assert_eq!(f.executor.calls_for(&b), vec![LOW]);
        let alerts = f.alerts.recent(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ActionFailed);
        assert_eq!(alerts[0].identity, a);
    }

    #[test]
    fn test_stale_identity_is_skipped() {
        let f = Fixture::new();
        let old = f.spawn(10, 100, "app", 80.0);
        f.catalog.add_rule(cpu_rule("app", 50.0, LOW, true)).unwrap();
        // pid 被新进程复用
        f.resolver.set(10, 500);

        let report = f.evaluator.run_pass();
        assert!(f.executor.calls_for(&old).is_empty());
        assert_eq!(report.skipped_stale, 1);
    }

    #[test]
    fn test_notification_suppressed_until_cleared() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app", 80.0);
        f.catalog.add_rule(cpu_rule("app", 50.0, LOW, true)).unwrap();

        f.evaluator.run_pass();
        f.evaluator.run_pass();
        assert_eq!(f.alerts.len(), 1);
        assert_eq!(f.executor.calls_for(&app).len(), 2);

        f.sampler.set(app, ProcessStats { cpu_usage: 10.0, ..Default::default() });
        f.evaluator.run_pass();
        f.sampler.set(app, ProcessStats { cpu_usage: 90.0, ..Default::default() });
        f.evaluator.run_pass();
        assert_eq!(f.alerts.len(), 2);
    }

    #[test]
    fn test_notify_disabled_still_acts() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app", 80.0);
        f.catalog.add_rule(cpu_rule("app", 50.0, LOW, false)).unwrap();

        f.evaluator.run_pass();
        assert_eq!(f.executor.calls_for(&app), vec![LOW]);
        assert!(f.alerts.is_empty());
    }

    #[test]
    fn test_instance_limit_ranks_by_creation_time() {
        let f = Fixture::new();
        let first = f.spawn(30, 100, "worker", 0.0);
        let third = f.spawn(10, 300, "worker", 0.0);
        let second = f.spawn(20, 200, "Worker", 0.0);
        f.catalog
            .add_rule(WatchdogRule::InstanceLimit(ProcessInstanceLimit {
                target: "worker".into(),
                threshold_instances: 2,
                action: RuleAction::TerminateProcess,
                notify: false,
            }))
            .unwrap();

        f.evaluator.run_pass();
        assert!(f.executor.calls_for(&first).is_empty());
        assert_eq!(f.executor.calls_for(&second), vec![RuleAction::TerminateProcess]);
        assert_eq!(f.executor.calls_for(&third), vec![RuleAction::TerminateProcess]);

        // 只在首次出现时评估
        f.executor.clear();
        f.evaluator.run_pass();
        assert!(f.executor.calls().is_empty());
    }

    #[test]
    fn test_defaults_applied_once() {
        let f = Fixture::new();
        let game = f.spawn(40, 100, "game", 0.0);
        f.catalog
            .add_defaults(ProcessDefaultCpuSettings {
                name: "game".into(),
                priority: Some(PriorityLevel::High),
                affinity: Some(0b1100),
            })
            .unwrap();

        let report = f.evaluator.run_pass();
        assert_eq!(report.defaults_applied, 1);
        assert_eq!(
            f.executor.calls_for(&game),
            vec![
                RuleAction::ChangePriority { level: PriorityLevel::High },
                RuleAction::ChangeAffinity { mask: 0b1100 },
            ]
        );

        f.executor.clear();
        f.evaluator.run_pass();
        assert!(f.executor.calls().is_empty());
    }

    #[test]
    fn test_removed_rule_absent_next_pass() {
        let f = Fixture::new();
        let app = f.spawn(10, 100, "app", 80.0);
        let rule = cpu_rule("app", 50.0, LOW, true);
        f.catalog.add_rule(rule.clone()).unwrap();

        f.evaluator.run_pass();
        f.catalog.remove_rule(&rule).unwrap();
        f.executor.clear();
        f.evaluator.run_pass();
        assert!(f.executor.calls_for(&app).is_empty());
    }

    #[test]
    fn test_concurrent_catalog_changes_during_passes() {
        let f = Arc::new(Fixture::new());
        for pid in 1..50 {
            f.spawn(pid, pid as u64, "app", 80.0);
        }

        let writer = {
            let f = f.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let rule = cpu_rule("app", 1.0 + (i % 50) as f32, LOW, true);
                    let _ = f.catalog.add_rule(rule.clone());
                    let _ = f.catalog.remove_rule(&rule);
                }
            })
        };
        for _ in 0..20 {
            f.evaluator.run_pass();
        }
        writer.join().unwrap();

        f.executor.clear();
        f.evaluator.run_pass();
        assert!(f.executor.calls().is_empty());
    }

    #[test]
    fn test_resolve_actions() {
        let actions = vec![LOW, RuleAction::EmptyWorkingSet, LOW];
        assert_eq!(
            resolve_actions(actions.into_iter(), false),
            vec![LOW, RuleAction::EmptyWorkingSet]
        );
        let with_kill = vec![LOW, RuleAction::TerminateProcess];
        assert_eq!(
            resolve_actions(with_kill.clone().into_iter(), false),
            vec![RuleAction::TerminateProcess]
        );
        assert_eq!(resolve_actions(with_kill.into_iter(), true), vec![LOW]);
    }

    #[test]
    fn test_suppression_tracker() {
        let mut tracker = SuppressionTracker::default();
        let id = ProcessIdentity::new(1, 1);
        let keys = vec!["a".to_string()];
        assert_eq!(tracker.observe(id, &keys), keys);
        assert!(tracker.observe(id, &keys).is_empty());
        assert!(tracker.is_suppressed(&id, "a"));

        tracker.retain(&HashSet::new());
        assert!(!tracker.is_suppressed(&id, "a"));
    }
}
