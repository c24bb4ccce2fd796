//! Prometheus metrics for kdrain

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

/// Pods removed, by removal method (evicted or deleted)
static PODS_REMOVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("kdrain_pods_removed_total", "Total number of pods removed"),
        &["method"]
    )
    .expect("Failed to create pods_removed metric")
});

/// Removal requests rejected by the API server
static REMOVAL_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "kdrain_pod_removal_failures_total",
            "Total number of rejected pod removal requests"
        ),
        &["method"]
    )
    .expect("Failed to create pod_removal_failures metric")
});

/// Pods still present when a wait timed out
static PODS_PENDING_AT_TIMEOUT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "kdrain_pods_pending_at_timeout_total",
            "Total number of pods still present when waiting timed out"
        ),
        &["method"]
    )
    .expect("Failed to create pods_pending_at_timeout metric")
});

/// Time spent waiting for pods to go away
static WAIT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "kdrain_wait_duration_seconds",
        "Duration of waits for pod removal",
        &["method"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .expect("Failed to create wait_duration metric")
});

/// Node level actions (cordon, uncordon, drain, delete)
static NODE_ACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("kdrain_node_actions_total", "Total number of node actions"),
        &["action"]
    )
    .expect("Failed to create node_actions metric")
});

/// Label value for a removal method
pub fn method_label(using_eviction: bool) -> &'static str {
    if using_eviction {
        "evict"
    } else {
        "delete"
    }
}

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*PODS_REMOVED;
        let _ = &*REMOVAL_FAILURES;
        let _ = &*PODS_PENDING_AT_TIMEOUT;
        let _ = &*WAIT_DURATION;
        let _ = &*NODE_ACTIONS;
        Self
    }

    /// Count pods that were confirmed gone
    pub fn inc_pods_removed(&self, using_eviction: bool, count: u64) {
        PODS_REMOVED
            .with_label_values(&[method_label(using_eviction)])
            .inc_by(count);
    }

    /// Count a rejected removal request
    pub fn inc_removal_failure(&self, using_eviction: bool) {
        REMOVAL_FAILURES
            .with_label_values(&[method_label(using_eviction)])
            .inc();
    }

    /// Count pods left behind by a timed out wait
    pub fn inc_pending_at_timeout(&self, using_eviction: bool, count: u64) {
        PODS_PENDING_AT_TIMEOUT
            .with_label_values(&[method_label(using_eviction)])
            .inc_by(count);
    }

    /// Record wait duration
    pub fn observe_wait_duration(&self, using_eviction: bool, duration_secs: f64) {
        WAIT_DURATION
            .with_label_values(&[method_label(using_eviction)])
            .observe(duration_secs);
    }

    /// Increment node action counter
    pub fn inc_node_action(&self, action: &str) {
        NODE_ACTIONS.with_label_values(&[action]).inc();
    }

    /// Render all registered metrics in the Prometheus text format
    pub fn gather_text(&self) -> String {
        prometheus::TextEncoder::new()
            .encode_to_string(&prometheus::gather())
            .unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
