//! 服务装配与引擎生命周期

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{SourceError, StoreError};
use crate::metrics::METRICS;
use crate::models::{ProcessIdentity, StoreChange};
use crate::services::{
    ActionExecutor, AlertLog, ChangeHub, CpuTimeEnergyEstimator, EbpfEventSource, EventSource,
    IdentityResolver, JsonRuleStore, LifecycleIngestor, LinuxActionExecutor, MetricSampler, PassReport,
    PolicyEvaluator, PollingEventSource, ProcessInspector, ProcfsInspector, Reconciler,
    RuleCatalog, RuleStore, SnapshotStore, SysinfoSampler, Watch,
};

/// 事件源选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceMode {
    /// 优先 eBPF，不可用时退回轮询
    Auto,
    Ebpf,
    Polling,
}

/// 运行配置
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub eval_interval: Duration,
    pub reconcile_interval: Duration,
    pub poll_interval: Duration,
    pub event_source: SourceMode,
    pub ebpf_object: PathBuf,
    pub rules_file: PathBuf,
    pub watts_per_core: f64,
    pub refresh_resources: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            eval_interval: Duration::from_millis(1000),
            reconcile_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(1000),
            event_source: SourceMode::Auto,
            ebpf_object: PathBuf::from(crate::services::ebpf_loader::DEFAULT_EBPF_OBJECT),
            rules_file: PathBuf::from("watchdog-rules.json"),
            watts_per_core: 15.0,
            refresh_resources: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub monitoring_mode: String,
    pub tracked_processes: usize,
    pub rules: usize,
    pub alerts: usize,
    pub focus: Option<ProcessIdentity>,
    pub last_pass: Option<PassReport>,
}

/// 所有服务的持有者，显式构造并注入
pub struct WatchdogState {
    pub config: WatchdogConfig,
    pub store: Arc<SnapshotStore>,
    pub catalog: Arc<RuleCatalog>,
    pub ingestor: Arc<LifecycleIngestor>,
    pub evaluator: Arc<PolicyEvaluator>,
    pub reconciler: Arc<Reconciler>,
    pub alerts: Arc<AlertLog>,
    pub rule_store: Arc<dyn RuleStore>,
    mode: RwLock<String>,
    focus: Mutex<Option<Watch>>,
    /// 导出与写盘串行，最后一次写入的总是最新的目录
    persist_lock: Mutex<()>,
}

impl WatchdogState {
    pub fn new<I: ProcessInspector + 'static>(
        config: WatchdogConfig,
        inspector: Arc<I>,
        sampler: Arc<dyn MetricSampler>,
        executor: Arc<dyn ActionExecutor>,
        rule_store: Arc<dyn RuleStore>,
    ) -> anyhow::Result<Self> {
        let catalog = Arc::new(RuleCatalog::new());
        let loaded = rule_store.load()?;
        catalog
            .import(loaded)
            .map_err(|e| anyhow::anyhow!("Invalid rule configuration: {}", e))?;

        let store = Arc::new(SnapshotStore::new());
        let resolver: Arc<dyn IdentityResolver> = inspector.clone();
        let inspector: Arc<dyn ProcessInspector> = inspector;
        let ingestor = Arc::new(LifecycleIngestor::new(
            store.clone(),
            resolver.clone(),
            ChangeHub::new(),
        ));
        let alerts = Arc::new(AlertLog::default());
        let evaluator = Arc::new(PolicyEvaluator::new(
            store.clone(),
            catalog.clone(),
            resolver,
            sampler,
            executor,
            alerts.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            inspector,
            ingestor.clone(),
            config.refresh_resources,
        ));

        Ok(Self {
            config,
            store,
            catalog,
            ingestor,
            evaluator,
            reconciler,
            alerts,
            rule_store,
            mode: RwLock::new("none".to_string()),
            focus: Mutex::new(None),
            persist_lock: Mutex::new(()),
        })
    }

    /// Linux 上的默认装配：procfs + sysinfo + libc + JSON 文件
    pub fn linux(config: WatchdogConfig) -> anyhow::Result<Self> {
        let inspector = Arc::new(ProcfsInspector::new());
        let sampler = Arc::new(SysinfoSampler::new(Arc::new(CpuTimeEnergyEstimator::new(
            config.watts_per_core,
        ))));
        let executor = Arc::new(LinuxActionExecutor::new(inspector.clone()));
        let rule_store = Arc::new(JsonRuleStore::new(config.rules_file.clone()));
        Self::new(config, inspector, sampler, executor, rule_store)
    }

    /// 按配置给出依次尝试的事件源
    pub fn event_sources(config: &WatchdogConfig) -> Vec<Box<dyn EventSource>> {
        let procfs = Arc::new(ProcfsInspector::new());
        let ebpf = || -> Box<dyn EventSource> {
            Box::new(EbpfEventSource::new(config.ebpf_object.clone(), procfs.clone()))
        };
        let polling = || -> Box<dyn EventSource> {
            Box::new(PollingEventSource::new(procfs.clone(), config.poll_interval))
        };
        match config.event_source {
            SourceMode::Auto => vec![ebpf(), polling()],
            SourceMode::Ebpf => vec![ebpf()],
            SourceMode::Polling => vec![polling()],
        }
    }

    pub fn monitoring_mode(&self) -> String {
        self.mode.read().clone()
    }

    fn set_mode(&self, mode: &str) {
        *self.mode.write() = mode.to_string();
        METRICS.set_mode(mode);
    }

    /// 保存当前规则目录
    pub fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock();
        self.rule_store.save(&self.catalog.export())
    }

    /// 关注一个进程；替换之前的关注
    pub fn set_focus(&self, identity: ProcessIdentity) {
        let handler = Arc::new(move |change: &StoreChange| {
            log::debug!("[focus] {}: {:?}", change.identity, change.change);
        });
        let mut focus = self.focus.lock();
        // 旧 Watch 必须先 drop，否则它会清掉新的关注目标
        focus.take();
        *focus = Some(self.ingestor.watch(identity, handler));
    }

    /// 取消关注；返回之前的关注目标
    pub fn clear_focus(&self) -> Option<ProcessIdentity> {
        self.focus.lock().take().map(|watch| watch.identity())
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            monitoring_mode: self.monitoring_mode(),
            tracked_processes: self.store.len(),
            rules: self.catalog.snapshot().rule_count(),
            alerts: self.alerts.len(),
            focus: self.ingestor.focus(),
            last_pass: self.evaluator.last_report(),
        }
    }
}

/// 运行中的引擎，`shutdown` 通知所有任务并等待它们退出
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }
}

/// 启动引擎：初始对账、事件源（失败时依次退回）、评估循环和对账循环
pub fn start_engine(state: Arc<WatchdogState>, sources: Vec<Box<dyn EventSource>>) -> EngineHandle {
    let (tx, rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let seeded = state.reconciler.reconcile();
    info!("✓ Seeded {} processes", seeded.added);

    for source in sources {
        match source.start(state.ingestor.clone(), rx.clone()) {
            Ok(task) => {
                state.set_mode(source.name());
                info!("✓ Monitoring mode: {}", source.name());
                tasks.push(task);
                break;
            }
            Err(e) => log_source_error(source.name(), &e),
        }
    }
    if state.monitoring_mode() == "none" {
        warn!("No event source available, relying on periodic reconciliation");
    }

    tasks.push(spawn_evaluator(state.clone(), rx.clone()));
    tasks.push(
        state
            .reconciler
            .clone()
            .spawn(state.config.reconcile_interval, rx),
    );

    EngineHandle { shutdown: tx, tasks }
}

fn spawn_evaluator(state: Arc<WatchdogState>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let period = state.config.eval_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("✓ Policy evaluator running every {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evaluator = state.evaluator.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || evaluator.run_pass()).await {
                        error!("Evaluation pass panicked: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Policy evaluator stopped");
    })
}

fn log_source_error(name: &str, e: &SourceError) {
    error!("❌ Failed to start {} event source: {}", name, e);
    error!("   Full error chain:");
    let mut current_error: Option<&dyn std::error::Error> = std::error::Error::source(e);
    while let Some(err) = current_error {
        error!("     - {}", err);
        current_error = err.source();
    }
    if matches!(e, SourceError::Unavailable(_)) {
        warn!("   Tip: Run with 'sudo' for eBPF support");
        warn!("   Build the probe with: cd ebpf && cargo +nightly build --release");
    }
}
