//! Prometheus metrics for the daemon
//!
//! Registered once into the default registry and exposed through the HTTP
//! API's `/metrics` route. The RPC latency histogram is labelled by RPC
//! name and error outcome so retry storms show up per call.

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_gauge,
    Histogram, HistogramVec, IntCounter, IntGauge,
};

const RPC_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const GC_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0];

static GLOBAL_METRICS: OnceLock<DaemonMetricsInner> = OnceLock::new();

struct DaemonMetricsInner {
    rpc_latency_seconds: HistogramVec,
    pending_pods: IntGauge,
    store_records: IntGauge,
    invalid_resources: IntGauge,
    gc_duration_seconds: Histogram,
    gc_runs_total: IntCounter,
    check_runs_total: IntCounter,
}

impl DaemonMetricsInner {
    fn new() -> Self {
        Self {
            rpc_latency_seconds: register_histogram_vec!(
                "podnet_rpc_latency_seconds",
                "Latency of CNI-facing RPC handlers",
                &["rpc", "error"],
                RPC_LATENCY_BUCKETS.to_vec()
            )
            .expect("failed to register rpc_latency_seconds"),

            pending_pods: register_int_gauge!(
                "podnet_pending_pods",
                "Pods with an allocate or release currently in flight"
            )
            .expect("failed to register pending_pods"),

            store_records: register_int_gauge!(
                "podnet_store_records",
                "Pod resource records currently persisted"
            )
            .expect("failed to register store_records"),

            invalid_resources: register_int_gauge!(
                "podnet_invalid_resources",
                "Entries of the three-way mapping that failed validation"
            )
            .expect("failed to register invalid_resources"),

            gc_duration_seconds: register_histogram!(
                "podnet_gc_duration_seconds",
                "Wall time of one garbage collection tick",
                GC_DURATION_BUCKETS.to_vec()
            )
            .expect("failed to register gc_duration_seconds"),

            gc_runs_total: register_int_counter!(
                "podnet_gc_runs_total",
                "Garbage collection ticks completed"
            )
            .expect("failed to register gc_runs_total"),

            check_runs_total: register_int_counter!(
                "podnet_check_runs_total",
                "Period check passes completed"
            )
            .expect("failed to register check_runs_total"),
        }
    }
}

/// Cheap handle to the process-wide metrics.
#[derive(Clone)]
pub struct DaemonMetrics {
    _private: (),
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DaemonMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DaemonMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn observe_rpc(&self, rpc: &str, elapsed: Duration, error: bool) {
        self.inner()
            .rpc_latency_seconds
            .with_label_values(&[rpc, if error { "true" } else { "false" }])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_pending_pods(&self, count: i64) {
        self.inner().pending_pods.set(count);
    }

    pub fn set_store_records(&self, count: i64) {
        self.inner().store_records.set(count);
    }

    pub fn set_invalid_resources(&self, count: i64) {
        self.inner().invalid_resources.set(count);
    }

    pub fn observe_gc(&self, elapsed: Duration) {
        self.inner().gc_duration_seconds.observe(elapsed.as_secs_f64());
        self.inner().gc_runs_total.inc();
    }

    pub fn inc_check_runs(&self) {
        self.inner().check_runs_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_observable() {
        let metrics = DaemonMetrics::new();
        metrics.observe_rpc("AllocIP", Duration::from_millis(12), false);
        metrics.observe_rpc("ReleaseIP", Duration::from_millis(7), true);
        metrics.set_pending_pods(2);
        metrics.set_store_records(14);
        metrics.set_invalid_resources(0);
        metrics.observe_gc(Duration::from_millis(120));
        metrics.inc_check_runs();
    }
}
