//! Observability infrastructure for the I/O weight controller.
//!
//! Provides:
//! - Prometheus metrics (setpoint gauges, latency, adjustments, errors)
//! - Structured JSON logging with tracing
//!
//! Metric names are carried over from `docker/drcio/controller.py` so
//! existing dashboards built against the Python controller keep working.

use crate::errors::ErrorKind;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Bucket boundaries for the control-loop-duration histogram, carried
/// over unchanged from the Python controller's `drcio_control_loop_duration_seconds`.
const LOOP_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0,
];

static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    hp_weight: IntGauge,
    lp_weight: IntGauge,
    hp_latency_ms: IntGauge,
    pod_count: IntGaugeVec,
    adjustments_total: IntCounter,
    errors_total: IntCounterVec,
    last_adjustment_timestamp: IntGauge,
    control_loop_duration_seconds: Histogram,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            hp_weight: register_int_gauge!("drcio_hp_weight", "Current io.weight assigned to HP pods")
                .expect("failed to register drcio_hp_weight"),

            lp_weight: register_int_gauge!("drcio_lp_weight", "Current io.weight assigned to LP pods")
                .expect("failed to register drcio_lp_weight"),

            hp_latency_ms: register_int_gauge!(
                "drcio_hp_latency_ms",
                "Most recently observed HP tail latency in milliseconds"
            )
            .expect("failed to register drcio_hp_latency_ms"),

            pod_count: register_int_gauge_vec!(
                "drcio_pod_count",
                "Number of pods discovered per priority class",
                &["priority"]
            )
            .expect("failed to register drcio_pod_count"),

            adjustments_total: register_int_counter!(
                "drcio_adjustments_total",
                "Total number of setpoint adjustments applied"
            )
            .expect("failed to register drcio_adjustments_total"),

            errors_total: register_int_counter_vec!(
                "drcio_errors_total",
                "Total number of classified errors encountered",
                &["error_type"]
            )
            .expect("failed to register drcio_errors_total"),

            last_adjustment_timestamp: register_int_gauge!(
                "drcio_last_adjustment_timestamp",
                "Unix timestamp of the most recent applied adjustment"
            )
            .expect("failed to register drcio_last_adjustment_timestamp"),

            control_loop_duration_seconds: register_histogram!(
                "drcio_control_loop_duration_seconds",
                "Wall-clock duration of one control loop tick",
                LOOP_DURATION_BUCKETS.to_vec()
            )
            .expect("failed to register drcio_control_loop_duration_seconds"),
        }
    }
}

/// Lightweight handle to the process-wide metrics registry. Cloning
/// shares the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn set_setpoint(&self, hp_weight: u32, lp_weight: u32) {
        self.inner().hp_weight.set(hp_weight as i64);
        self.inner().lp_weight.set(lp_weight as i64);
    }

    pub fn set_hp_latency_ms(&self, latency_ms: f64) {
        self.inner().hp_latency_ms.set(latency_ms.round() as i64);
    }

    pub fn set_pod_counts(&self, hp_count: usize, lp_count: usize) {
        self.inner().pod_count.with_label_values(&["hp"]).set(hp_count as i64);
        self.inner().pod_count.with_label_values(&["lp"]).set(lp_count as i64);
    }

    pub fn inc_adjustments(&self) {
        self.inner().adjustments_total.inc();
    }

    pub fn inc_error(&self, kind: ErrorKind) {
        self.inner()
            .errors_total
            .with_label_values(&[kind.as_label()])
            .inc();
    }

    pub fn set_last_adjustment_unix(&self, ts: i64) {
        self.inner().last_adjustment_timestamp.set(ts);
    }

    pub fn observe_tick_duration(&self, duration_secs: f64) {
        self.inner()
            .control_loop_duration_seconds
            .observe(duration_secs);
    }
}

/// Structured JSON event logger for controller lifecycle and adjustment
/// events, in the same spirit as the collector's startup/shutdown logging.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, mode: &str) {
        info!(
            event = "controller_started",
            node = %self.node_name,
            controller_version = %version,
            mode = %mode,
            "adaptive I/O weight controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            node = %self.node_name,
            reason = %reason,
            "adaptive I/O weight controller shutting down"
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_adjustment(
        &self,
        old_hp: u32,
        old_lp: u32,
        new_hp: u32,
        new_lp: u32,
        latency_ms: f64,
        hp_applied: usize,
        hp_total: usize,
        lp_applied: usize,
        lp_total: usize,
    ) {
        info!(
            event = "setpoint_adjusted",
            node = %self.node_name,
            old_hp_weight = old_hp,
            old_lp_weight = old_lp,
            new_hp_weight = new_hp,
            new_lp_weight = new_lp,
            hp_latency_ms = latency_ms,
            hp_applied,
            hp_total,
            lp_applied,
            lp_total,
            "setpoint adjusted"
        );
    }

    pub fn log_latency_source_degraded(&self, consecutive_failures: u32) {
        warn!(
            event = "latency_source_degraded",
            node = %self.node_name,
            consecutive_failures,
            "latency source has failed repeatedly; HP SLO may be unmonitored"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_can_be_set_and_observed() {
        let metrics = ControllerMetrics::new();
        metrics.set_setpoint(700, 300);
        metrics.set_hp_latency_ms(412.6);
        metrics.set_pod_counts(3, 5);
        metrics.inc_adjustments();
        metrics.inc_error(ErrorKind::CgroupNotFound);
        metrics.set_last_adjustment_unix(1_700_000_000);
        metrics.observe_tick_duration(0.12);
    }

    #[test]
    fn structured_logger_creation() {
        let logger = StructuredLogger::new("node-1");
        assert_eq!(logger.node_name, "node-1");
        logger.log_startup("0.1.0", "weight");
        logger.log_adjustment(500, 500, 700, 300, 620.0, 2, 2, 1, 2);
        logger.log_latency_source_degraded(3);
        logger.log_shutdown("sigterm");
    }
}
