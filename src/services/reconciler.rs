//! 定期全量对账
//!
//! 事件流可能丢事件，定期重新枚举 OS 状态：补上缺失的进程，移除已经消失
//! 的进程，可选地全量刷新线程、模块、句柄和内存区域。

use log::{debug, info};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::models::{ChangeKind, ProcessIdentity, ResourceSet, StoreChange};
use crate::services::identity::ProcessInspector;
use crate::services::ingestor::{IngestOutcome, LifecycleIngestor};
use crate::services::procfs::boot_clock_ns;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub evicted: usize,
    pub refreshed: usize,
}

pub struct Reconciler {
    inspector: Arc<dyn ProcessInspector>,
    ingestor: Arc<LifecycleIngestor>,
    refresh_resources: bool,
}

impl Reconciler {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        ingestor: Arc<LifecycleIngestor>,
        refresh_resources: bool,
    ) -> Self {
        Self {
            inspector,
            ingestor,
            refresh_resources,
        }
    }

    pub fn reconcile(&self) -> ReconcileReport {
        let now = boot_clock_ns();
        let mut report = ReconcileReport::default();
        let store = self.ingestor.store();

        // 先取跟踪集合再枚举：枚举期间新启动的进程不在这个集合里，不会被误删
        let tracked = store.identities();
        let live = self.inspector.enumerate();
        let live_set: HashSet<ProcessIdentity> = live.iter().map(|(id, _)| *id).collect();

        for identity in tracked {
            if live_set.contains(&identity) || self.inspector.is_current(&identity) {
                continue;
            }
            self.ingestor.stop_process(&identity);
            report.evicted += 1;
        }

        for (identity, metadata) in live {
            let tracked = store.contains(&identity);
            if tracked && !self.refresh_resources {
                continue;
            }

            let resources = if self.refresh_resources {
                self.inspector.resources(identity.pid).ok()
            } else {
                // 新进程至少带上当前线程
                self.inspector.threads(identity.pid).ok().map(|threads| ResourceSet {
                    threads,
                    ..Default::default()
                })
            };

            if tracked {
                if let Some(resources) = resources {
                    if store.refresh_resources(&identity, resources, now) {
                        self.ingestor.hub().publish(&StoreChange {
                            identity,
                            change: ChangeKind::Refreshed,
                        });
                        report.refreshed += 1;
                    }
                }
                continue;
            }

            if self.ingestor.seed(identity, metadata, resources, now) == IngestOutcome::Applied {
                report.added += 1;
            }
        }

        if report.added > 0 || report.evicted > 0 {
            debug!(
                "Reconciled: {} added, {} evicted, {} refreshed",
                report.added, report.evicted, report.refreshed
            );
        }
        report
    }

    /// 按固定周期对账直到收到关闭信号
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 第一次 tick 立即完成，启动时已经对账过
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reconciler = self.clone();
                        match tokio::task::spawn_blocking(move || reconciler.reconcile()).await {
                            Ok(report) => debug!("Reconcile pass: {:?}", report),
                            Err(e) => log::error!("Reconcile task failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Reconciler stopped");
        })
    }
}
