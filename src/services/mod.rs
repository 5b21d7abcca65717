pub mod alerts;
pub mod change_hub;
pub mod ebpf_loader;
pub mod evaluator;
pub mod event_source;
pub mod executor;
pub mod identity;
pub mod ingestor;
pub mod name_matcher;
pub mod procfs;
pub mod reconciler;
pub mod rule_catalog;
pub mod rule_store;
pub mod snapshot_store;
pub mod stats_collector;

pub use alerts::{Alert, AlertKind, AlertLog, AlertSink};
pub use change_hub::{ChangeHandler, ChangeHub, Subscription};
pub use ebpf_loader::EbpfEventSource;
pub use evaluator::{PassReport, PolicyEvaluator};
pub use event_source::{EventSource, PollingEventSource};
pub use executor::{ActionExecutor, LinuxActionExecutor};
pub use identity::{IdentityResolver, ProcessInspector};
pub use ingestor::{IngestOutcome, LifecycleIngestor, Watch};
pub use procfs::ProcfsInspector;
pub use reconciler::Reconciler;
pub use rule_catalog::{CatalogSnapshot, RuleCatalog};
pub use rule_store::{JsonRuleStore, RuleStore};
pub use snapshot_store::SnapshotStore;
pub use stats_collector::{CpuTimeEnergyEstimator, EnergyEstimator, MetricSampler, SysinfoSampler};
