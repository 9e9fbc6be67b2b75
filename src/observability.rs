//! The controller's own Prometheus metrics: counters for resize outcomes and
//! loop health, gauges for the current PVC population, and info-style gauges
//! carrying the release version and effective settings.

use prometheus::{
    register_int_counter, register_int_gauge, register_int_gauge_vec, IntCounter, IntGauge,
    IntGaugeVec,
};
use std::sync::OnceLock;

use crate::config::Config;

const RELEASE_VERSION: &str = env!("CARGO_PKG_VERSION");

static GLOBAL_METRICS: OnceLock<MetricsInner> = OnceLock::new();

struct MetricsInner {
    resize_evaluated: IntCounter,
    resize_attempted: IntCounter,
    resize_successful: IntCounter,
    resize_failure: IntCounter,
    candidate_free_skipped: IntCounter,
    iteration_failed: IntCounter,
    iteration_overrun: IntCounter,
    num_valid_pvcs: IntGauge,
    num_pvcs_above_threshold: IntGauge,
    num_pvcs_below_threshold: IntGauge,
    num_pvcs_unmeasured: IntGauge,
    release_info: IntGaugeVec,
    settings_info: IntGaugeVec,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            resize_evaluated: register_int_counter!(
                "volume_autoscaler_resize_evaluated_total",
                "Reconciliation iterations that evaluated PVCs for resizing"
            )
            .expect("register resize_evaluated_total"),
            resize_attempted: register_int_counter!(
                "volume_autoscaler_resize_attempted_total",
                "Resize patches attempted against the Kubernetes API"
            )
            .expect("register resize_attempted_total"),
            resize_successful: register_int_counter!(
                "volume_autoscaler_resize_successful_total",
                "Resize patches acknowledged by the Kubernetes API"
            )
            .expect("register resize_successful_total"),
            resize_failure: register_int_counter!(
                "volume_autoscaler_resize_failure_total",
                "Resize patches rejected or timed out"
            )
            .expect("register resize_failure_total"),
            candidate_free_skipped: register_int_counter!(
                "volume_autoscaler_candidate_free_skipped_total",
                "Above-threshold observations skipped because the PVC is ignored or its class cannot expand"
            )
            .expect("register candidate_free_skipped_total"),
            iteration_failed: register_int_counter!(
                "volume_autoscaler_iteration_failed_total",
                "Iterations aborted before evaluating PVCs"
            )
            .expect("register iteration_failed_total"),
            iteration_overrun: register_int_counter!(
                "volume_autoscaler_iteration_overrun_total",
                "Iterations that ran longer than the configured interval"
            )
            .expect("register iteration_overrun_total"),
            num_valid_pvcs: register_int_gauge!(
                "volume_autoscaler_num_valid_pvcs",
                "PVCs with utilization metrics considered in the last iteration"
            )
            .expect("register num_valid_pvcs"),
            num_pvcs_above_threshold: register_int_gauge!(
                "volume_autoscaler_num_pvcs_above_threshold",
                "PVCs above their scaling threshold in the last iteration"
            )
            .expect("register num_pvcs_above_threshold"),
            num_pvcs_below_threshold: register_int_gauge!(
                "volume_autoscaler_num_pvcs_below_threshold",
                "PVCs below their scaling threshold in the last iteration"
            )
            .expect("register num_pvcs_below_threshold"),
            num_pvcs_unmeasured: register_int_gauge!(
                "volume_autoscaler_num_pvcs_unmeasured",
                "PVCs present in Kubernetes but absent from the metrics backend in the last iteration"
            )
            .expect("register num_pvcs_unmeasured"),
            release_info: register_int_gauge_vec!(
                "volume_autoscaler_release_info",
                "Release information about this volume autoscaler",
                &["version"]
            )
            .expect("register release_info"),
            settings_info: register_int_gauge_vec!(
                "volume_autoscaler_settings_info",
                "Settings currently used by this volume autoscaler",
                &[
                    "interval_time_seconds",
                    "scale_above_percent",
                    "scale_after_intervals",
                    "scale_up_percent",
                    "scale_up_minimum_increment_bytes",
                    "scale_up_maximum_increment_bytes",
                    "scale_up_maximum_size_bytes",
                    "scale_cooldown_time_seconds",
                    "gcp_project_id",
                    "dry_run",
                    "gmp_label_match",
                    "http_timeout_seconds",
                    "verbose_enabled",
                ]
            )
            .expect("register settings_info"),
        }
    }
}

/// Cheap cloneable handle over the process-wide metrics registry.
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
        GLOBAL_METRICS.get_or_init(MetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &'static MetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    /// Export release and settings info once at startup.
    pub fn set_info(&self, config: &Config, project_id: &str) {
        self.inner()
            .release_info
            .with_label_values(&[RELEASE_VERSION])
            .set(1);
        let settings = config.settings(project_id);
        let values: Vec<&str> = settings.iter().map(|(_, v)| v.as_str()).collect();
        self.inner().settings_info.with_label_values(&values).set(1);
    }

    pub fn inc_resize_evaluated(&self) {
        self.inner().resize_evaluated.inc();
    }

    pub fn inc_resize_attempted(&self) {
        self.inner().resize_attempted.inc();
    }

    pub fn inc_resize_successful(&self) {
        self.inner().resize_successful.inc();
    }

    pub fn inc_resize_failure(&self) {
        self.inner().resize_failure.inc();
    }

    pub fn inc_candidate_free_skipped(&self) {
        self.inner().candidate_free_skipped.inc();
    }

    pub fn inc_iteration_failed(&self) {
        self.inner().iteration_failed.inc();
    }

    pub fn inc_iteration_overrun(&self) {
        self.inner().iteration_overrun.inc();
    }

    /// Refresh the population gauges at the end of an iteration.
    pub fn set_pvc_counts(&self, valid: usize, above: usize, below: usize, unmeasured: usize) {
        let inner = self.inner();
        inner.num_valid_pvcs.set(valid as i64);
        inner.num_pvcs_above_threshold.set(above as i64);
        inner.num_pvcs_below_threshold.set(below as i64);
        inner.num_pvcs_unmeasured.set(unmeasured as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once_and_accept_updates() {
        let metrics = ControllerMetrics::new();
        // A second handle shares the same registry instead of re-registering.
        let again = ControllerMetrics::new();

        metrics.inc_resize_evaluated();
        again.inc_resize_successful();
        metrics.set_pvc_counts(12, 3, 9, 1);
        metrics.set_info(&Config::default(), "my-project");

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "volume_autoscaler_num_valid_pvcs"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "volume_autoscaler_settings_info"));
    }
}
