//! 事件源：把 OS 的生命周期变化推送给 ingestor

use log::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::SourceError;
use crate::models::{EventKind, ProcessIdentity, RawEvent};
use crate::services::identity::ProcessInspector;
use crate::services::ingestor::LifecycleIngestor;
use crate::services::procfs::boot_clock_ns;

/// 事件源
///
/// `start` 必须在 tokio runtime 内调用；初始化失败返回
/// `SourceError::Unavailable`，调用方可以换用其它事件源。
pub trait EventSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(
        &self,
        ingestor: Arc<LifecycleIngestor>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, SourceError>;
}

/// 一次轮询相对上一次的差异
#[derive(Debug, Default)]
pub struct PollDiff {
    /// 已经消失的进程（精确身份）
    pub exited: Vec<ProcessIdentity>,
    /// 新进程和线程变化
    pub events: Vec<RawEvent>,
}

/// 上一次轮询看到的进程和线程
#[derive(Debug, Default)]
pub struct PollState {
    processes: HashMap<u32, (ProcessIdentity, BTreeSet<u32>)>,
}

impl PollState {
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

/// 轮询 procfs 并与上一次的结果做差
pub struct PollingEventSource {
    inspector: Arc<dyn ProcessInspector>,
    interval: Duration,
}

impl PollingEventSource {
    pub fn new(inspector: Arc<dyn ProcessInspector>, interval: Duration) -> Self {
        Self { inspector, interval }
    }

    pub fn poll_once(inspector: &dyn ProcessInspector, state: &mut PollState) -> PollDiff {
        let now = boot_clock_ns();
        let mut current: HashMap<u32, (ProcessIdentity, BTreeSet<u32>)> = HashMap::new();
        for pid in inspector.list_pids() {
            let Ok(identity) = inspector.resolve(pid) else {
                continue;
            };
            let threads = inspector
                .threads(pid)
                .map(|tids| tids.into_iter().collect())
                .unwrap_or_default();
            current.insert(pid, (identity, threads));
        }

        let mut diff = PollDiff::default();
        for (pid, (previous, _)) in &state.processes {
            match current.get(pid) {
                Some((identity, _)) if identity == previous => {}
                _ => diff.exited.push(*previous),
            }
        }
        diff.exited.sort();

        let mut pids: Vec<&u32> = current.keys().collect();
        pids.sort_unstable();
        for pid in pids {
            let (identity, threads) = &current[pid];
            match state.processes.get(pid) {
                Some((previous, old_threads)) if previous == identity => {
                    for tid in threads.difference(old_threads) {
                        diff.events.push(RawEvent::new(now, EventKind::ThreadStart { pid: *pid, tid: *tid }));
                    }
                    for tid in old_threads.difference(threads) {
                        diff.events.push(RawEvent::new(now, EventKind::ThreadStop { pid: *pid, tid: *tid }));
                    }
                }
                _ => {
                    let Ok(metadata) = inspector.metadata(*pid) else {
                        continue;
                    };
                    diff.events.push(RawEvent::new(
                        now,
                        EventKind::ProcessStart {
                            pid: *pid,
                            creation_time: Some(identity.creation_time),
                            image_name: metadata.name,
                            image_path: metadata.image_path,
                            command_line: metadata.command_line,
                        },
                    ));
                    for tid in threads.iter().filter(|tid| **tid != *pid) {
                        diff.events.push(RawEvent::new(now, EventKind::ThreadStart { pid: *pid, tid: *tid }));
                    }
                }
            }
        }

        state.processes = current;
        diff
    }

    /// 先移除消失的进程，再应用新事件
    pub fn apply(ingestor: &LifecycleIngestor, diff: PollDiff) {
        for identity in &diff.exited {
            ingestor.stop_process(identity);
        }
        for event in diff.events {
            ingestor.handle(event);
        }
    }
}

impl EventSource for PollingEventSource {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn start(
        &self,
        ingestor: Arc<LifecycleIngestor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, SourceError> {
        let inspector = self.inspector.clone();
        let period = self.interval;
        info!("✓ Polling event source started (interval {:?})", period);

        Ok(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut state = PollState::default();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let diff = Self::poll_once(inspector.as_ref(), &mut state);
                        if !diff.exited.is_empty() || !diff.events.is_empty() {
                            debug!(
                                "Poll: {} exited, {} events, {} processes",
                                diff.exited.len(),
                                diff.events.len(),
                                state.len()
                            );
                        }
                        Self::apply(&ingestor, diff);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Polling event source stopped");
        }))
    }
}
