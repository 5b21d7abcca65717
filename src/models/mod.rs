pub mod events;
pub mod process;
pub mod rules;
pub mod snapshot;
pub mod stats;

pub use events::{ChangeKind, EventKind, RawEvent, StoreChange};
pub use process::{normalize_name, same_name, ProcessIdentity, ProcessMetadata};
pub use rules::{
    CatalogConfig, CpuThresholdRule, DisallowedProcess, MemoryThresholdRule, PermanentProcess,
    PriorityLevel, ProcessDefaultCpuSettings, ProcessEnergyUsageRule, ProcessInstanceLimit,
    RuleAction, RuleKind, WatchdogRule, GLOBAL_TARGET,
};
pub use snapshot::{LoadedModule, MemoryRegion, OpenHandle, ProcessSnapshot, ResourceSet};
pub use stats::ProcessStats;
