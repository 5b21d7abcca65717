use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::error::LookupError;
use crate::models::{ProcessIdentity, ProcessStats};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// sysinfo 的启动时间精度是秒，允许的偏差
const START_TIME_TOLERANCE_SECS: u64 = 2;

/// 资源采样端口
///
/// `refresh` 每轮评估调用一次；CPU 使用率是两次 refresh 之间的平均值。
pub trait MetricSampler: Send + Sync {
    fn refresh(&self);

    fn sample(&self, identity: &ProcessIdentity) -> Result<ProcessStats, LookupError>;
}

/// 能耗估算（可替换）
pub trait EnergyEstimator: Send + Sync {
    /// 根据采样结果估算累计能耗（焦耳）
    fn estimate(&self, stats: &ProcessStats) -> f64;
}

/// 按累计 CPU 时间 × 单核功耗估算
#[derive(Debug, Clone)]
pub struct CpuTimeEnergyEstimator {
    pub watts_per_core: f64,
}

impl CpuTimeEnergyEstimator {
    pub fn new(watts_per_core: f64) -> Self {
        Self { watts_per_core }
    }
}

impl EnergyEstimator for CpuTimeEnergyEstimator {
    fn estimate(&self, stats: &ProcessStats) -> f64 {
        stats.cpu_time_ms as f64 / 1000.0 * self.watts_per_core
    }
}

pub struct SysinfoSampler {
    system: Mutex<System>,
    cpu_count: usize,
    energy: Arc<dyn EnergyEstimator>,
}

impl SysinfoSampler {
    pub fn new(energy: Arc<dyn EnergyEstimator>) -> Self {
        let system = System::new_all();
        let cpu_count = system.cpus().len().max(1);
        Self {
            system: Mutex::new(system),
            cpu_count,
            energy,
        }
    }

    /// 把 sysinfo 的启动时间（Unix 秒）和身份的创建时间（开机纳秒）对齐比较
    fn same_incarnation(identity: &ProcessIdentity, start_time: u64) -> bool {
        let expected = System::boot_time() + identity.creation_time / NANOS_PER_SEC;
        expected.abs_diff(start_time) <= START_TIME_TOLERANCE_SECS
    }
}

impl MetricSampler for SysinfoSampler {
    fn refresh(&self) {
        let mut sys = self.system.lock();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
    }

    fn sample(&self, identity: &ProcessIdentity) -> Result<ProcessStats, LookupError> {
        let sys = self.system.lock();
        let process = sys
            .process(Pid::from_u32(identity.pid))
            .ok_or(LookupError::NotFound(identity.pid))?;

        if !Self::same_incarnation(identity, process.start_time()) {
            return Err(LookupError::Stale(*identity));
        }

        let mut stats = ProcessStats {
            // sysinfo 按单核计算，可超过 100%
            cpu_usage: process.cpu_usage() / self.cpu_count as f32,
            memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            cpu_time_ms: process.accumulated_cpu_time(),
            energy_joules: 0.0,
        };
        stats.energy_joules = self.energy.estimate(&stats);

        Ok(stats)
    }
}
