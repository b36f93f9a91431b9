//! Prometheus metrics for job pipelines
//!
//! Everything is labelled with the pipeline name.

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
        .ok()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Pipeline metrics helper
#[derive(Debug, Clone)]
pub struct JobsMetrics {
    pipeline: String,
}

impl JobsMetrics {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
        }
    }

    /// Record a lifecycle transition (run, pause, resume, stop)
    pub fn transition(&self, event: &'static str, elapsed: Duration) {
        counter!(
            "jobs_pipeline_transitions_total",
            "pipeline" => self.pipeline.clone(),
            "event" => event
        )
        .increment(1);

        histogram!(
            "jobs_pipeline_transition_seconds",
            "pipeline" => self.pipeline.clone(),
            "event" => event
        )
        .record(elapsed.as_secs_f64());
    }

    /// Record a message read from the local buffer
    pub fn message_received(&self) {
        counter!(
            "jobs_messages_received_total",
            "pipeline" => self.pipeline.clone()
        )
        .increment(1);
    }

    /// Record a message dropped without ack or nak
    pub fn message_dropped(&self, reason: &'static str) {
        counter!(
            "jobs_messages_dropped_total",
            "pipeline" => self.pipeline.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn pushed(&self) {
        counter!("jobs_pushed_total", "pipeline" => self.pipeline.clone()).increment(1);
    }

    pub fn requeued(&self) {
        counter!("jobs_requeued_total", "pipeline" => self.pipeline.clone()).increment(1);
    }

    /// Record a failed message delete (op = "ack" or "requeue")
    pub fn delete_failed(&self, op: &'static str) {
        counter!(
            "jobs_delete_failures_total",
            "pipeline" => self.pipeline.clone(),
            "op" => op
        )
        .increment(1);
    }

    /// Whether a listener is delivering
    pub fn listener_active(&self, active: bool) {
        gauge!(
            "jobs_listener_active",
            "pipeline" => self.pipeline.clone()
        )
        .set(if active { 1.0 } else { 0.0 });
    }
}
