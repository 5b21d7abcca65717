use prometheus::{
    Encoder, GaugeVec, CounterVec, Histogram, HistogramOpts, IntCounter, IntGauge, Opts,
    Registry, TextEncoder,
    register_gauge_vec_with_registry, register_counter_vec_with_registry,
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry,
};
use lazy_static::lazy_static;
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,

    // Gauge metrics
    pub tracked_processes: IntGauge,
    pub monitoring_mode: GaugeVec,

    // Counter metrics
    pub events_total: CounterVec,
    pub actions_total: CounterVec,
    pub alerts_total: CounterVec,
    pub evaluation_passes: IntCounter,

    pub evaluation_pass_seconds: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tracked_processes = register_int_gauge_with_registry!(
            Opts::new("watchdog_tracked_processes", "Number of processes in the snapshot store"),
            registry
        )?;

        let monitoring_mode = register_gauge_vec_with_registry!(
            Opts::new("watchdog_monitoring_mode", "Active event source (1 = active)"),
            &["mode"],
            registry
        )?;

        let events_total = register_counter_vec_with_registry!(
            Opts::new("watchdog_events_total", "Lifecycle events ingested by kind and outcome"),
            &["kind", "outcome"],
            registry
        )?;

        let actions_total = register_counter_vec_with_registry!(
            Opts::new("watchdog_actions_total", "Enforcement actions by action and outcome"),
            &["action", "outcome"],
            registry
        )?;

        let alerts_total = register_counter_vec_with_registry!(
            Opts::new("watchdog_alerts_total", "User-facing alerts raised"),
            &["kind"],
            registry
        )?;

        let evaluation_passes = register_int_counter_with_registry!(
            Opts::new("watchdog_evaluation_passes_total", "Completed evaluation passes"),
            registry
        )?;

        let evaluation_pass_seconds = register_histogram_with_registry!(
            HistogramOpts::new("watchdog_evaluation_pass_seconds", "Duration of an evaluation pass")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            registry
        )?;

        Ok(Self {
            registry,
            tracked_processes,
            monitoring_mode,
            events_total,
            actions_total,
            alerts_total,
            evaluation_passes,
            evaluation_pass_seconds,
        })
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_event(&self, kind: &str, applied: bool) {
        let outcome = if applied { "applied" } else { "dropped" };
        self.events_total.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_action(&self, action: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.actions_total.with_label_values(&[action, outcome]).inc();
    }

    pub fn set_mode(&self, active: &str) {
        for mode in ["ebpf", "polling"] {
            self.monitoring_mode
                .with_label_values(&[mode])
                .set(if mode == active { 1.0 } else { 0.0 });
        }
    }
}

lazy_static! {
    pub static ref METRICS: Arc<MetricsRegistry> =
        Arc::new(MetricsRegistry::new().expect("metric definitions are valid"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_families() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.record_event("process_start", true);
        metrics.record_action("terminate", false);
        metrics.set_mode("polling");

        let text = metrics.render().unwrap();
        assert!(text.contains("watchdog_events_total"));
        assert!(text.contains("outcome=\"failure\""));
        assert!(text.contains("watchdog_monitoring_mode{mode=\"polling\"} 1"));
    }
}
