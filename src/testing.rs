//! 测试用的内存实现（`test-utils` feature）

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ActionError, LookupError};
use crate::models::{
    ProcessIdentity, ProcessMetadata, ProcessStats, ResourceSet, RuleAction,
};
use crate::services::executor::ActionExecutor;
use crate::services::identity::{IdentityResolver, ProcessInspector};
use crate::services::rule_store::JsonRuleStore;
use crate::services::stats_collector::MetricSampler;
use crate::state::{SourceMode, WatchdogConfig, WatchdogState};

/// pid -> 创建时间，可随时修改以模拟退出和 pid 复用
#[derive(Default)]
pub struct FakeResolver {
    live: DashMap<u32, u64>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: u32, creation_time: u64) {
        self.live.insert(pid, creation_time);
    }

    pub fn kill(&self, pid: u32) {
        self.live.remove(&pid);
    }
}

impl IdentityResolver for FakeResolver {
    fn resolve(&self, pid: u32) -> Result<ProcessIdentity, LookupError> {
        self.live
            .get(&pid)
            .map(|created| ProcessIdentity::new(pid, *created))
            .ok_or(LookupError::NotFound(pid))
    }
}

/// 内存中的进程表
#[derive(Default)]
pub struct FakeInspector {
    processes: Mutex<HashMap<u32, (u64, ProcessMetadata, ResourceSet)>>,
}

impl FakeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, pid: u32, creation_time: u64, name: &str, threads: Vec<u32>) {
        let resources = ResourceSet {
            threads,
            ..Default::default()
        };
        self.processes
            .lock()
            .insert(pid, (creation_time, ProcessMetadata::new(name), resources));
    }

    pub fn set_resources(&self, pid: u32, resources: ResourceSet) {
        if let Some(entry) = self.processes.lock().get_mut(&pid) {
            entry.2 = resources;
        }
    }

    pub fn kill(&self, pid: u32) {
        self.processes.lock().remove(&pid);
    }
}

impl IdentityResolver for FakeInspector {
    fn resolve(&self, pid: u32) -> Result<ProcessIdentity, LookupError> {
        self.processes
            .lock()
            .get(&pid)
            .map(|(created, _, _)| ProcessIdentity::new(pid, *created))
            .ok_or(LookupError::NotFound(pid))
    }
}

impl ProcessInspector for FakeInspector {
    fn list_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.processes.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn metadata(&self, pid: u32) -> Result<ProcessMetadata, LookupError> {
        self.processes
            .lock()
            .get(&pid)
            .map(|(_, metadata, _)| metadata.clone())
            .ok_or(LookupError::NotFound(pid))
    }

    fn threads(&self, pid: u32) -> Result<Vec<u32>, LookupError> {
        self.processes
            .lock()
            .get(&pid)
            .map(|(_, _, resources)| resources.threads.clone())
            .ok_or(LookupError::NotFound(pid))
    }

    fn resources(&self, pid: u32) -> Result<ResourceSet, LookupError> {
        self.processes
            .lock()
            .get(&pid)
            .map(|(_, _, resources)| resources.clone())
            .ok_or(LookupError::NotFound(pid))
    }
}

/// 预设采样值
#[derive(Default)]
pub struct FakeSampler {
    stats: DashMap<ProcessIdentity, ProcessStats>,
}

impl FakeSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: ProcessIdentity, stats: ProcessStats) {
        self.stats.insert(identity, stats);
    }

    pub fn remove(&self, identity: &ProcessIdentity) {
        self.stats.remove(identity);
    }
}

impl MetricSampler for FakeSampler {
    fn refresh(&self) {}

    fn sample(&self, identity: &ProcessIdentity) -> Result<ProcessStats, LookupError> {
        self.stats
            .get(identity)
            .map(|stats| stats.clone())
            .ok_or(LookupError::NotFound(identity.pid))
    }
}

/// 记录所有调用；可以让指定身份的动作失败
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(ProcessIdentity, RuleAction)>>,
    failing: DashMap<ProcessIdentity, ActionError>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, identity: ProcessIdentity, error: ActionError) {
        self.failing.insert(identity, error);
    }

    pub fn calls(&self) -> Vec<(ProcessIdentity, RuleAction)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, identity: &ProcessIdentity) -> Vec<RuleAction> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id == identity)
            .map(|(_, action)| *action)
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl ActionExecutor for RecordingExecutor {
    fn apply(&self, identity: &ProcessIdentity, action: &RuleAction) -> Result<(), ActionError> {
        self.calls.lock().push((*identity, *action));
        match self.failing.get(identity) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// 由上面几个假实现装配起来的完整状态，规则写到 `dir/rules.json`
pub struct Harness {
    pub inspector: Arc<FakeInspector>,
    pub sampler: Arc<FakeSampler>,
    pub executor: Arc<RecordingExecutor>,
    pub state: Arc<WatchdogState>,
}

impl Harness {
    pub fn new(dir: &Path) -> Self {
        let inspector = Arc::new(FakeInspector::new());
        let sampler = Arc::new(FakeSampler::new());
        let executor = Arc::new(RecordingExecutor::new());
        let config = WatchdogConfig {
            eval_interval: Duration::from_millis(10),
            reconcile_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
            event_source: SourceMode::Polling,
            rules_file: dir.join("rules.json"),
            ..Default::default()
        };
        let rule_store = Arc::new(JsonRuleStore::new(config.rules_file.clone()));
        let state = WatchdogState::new(
            config,
            inspector.clone(),
            sampler.clone(),
            executor.clone(),
            rule_store,
        )
        .expect("fake state builds");

        Self {
            inspector,
            sampler,
            executor,
            state: Arc::new(state),
        }
    }
}

pub fn test_state(dir: &Path) -> Arc<WatchdogState> {
    Harness::new(dir).state
}
