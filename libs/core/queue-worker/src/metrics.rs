//! Prometheus metrics for the queue worker
//!
//! Counters and gauges are recorded through the `metrics` facade; they are no-ops
//! until [`init_metrics`] installs the Prometheus recorder.

use crate::resilience::CircuitState;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Consumer metrics labeled by queue and handler
#[derive(Clone)]
pub struct QueueMetrics {
    queue_name: String,
    handler_name: String,
}

impl QueueMetrics {
    pub fn new(queue_name: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            handler_name: handler_name.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "queue_worker_messages_received_total",
            "queue" => self.queue_name.clone(),
            "handler" => self.handler_name.clone()
        )
        .increment(1);
    }

    pub fn message_completed(&self, duration: Duration) {
        counter!(
            "queue_worker_messages_settled_total",
            "queue" => self.queue_name.clone(),
            "handler" => self.handler_name.clone(),
            "outcome" => "completed"
        )
        .increment(1);

        histogram!(
            "queue_worker_processing_duration_seconds",
            "queue" => self.queue_name.clone(),
            "handler" => self.handler_name.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn message_abandoned(&self) {
        counter!(
            "queue_worker_messages_settled_total",
            "queue" => self.queue_name.clone(),
            "handler" => self.handler_name.clone(),
            "outcome" => "abandoned"
        )
        .increment(1);
    }

    pub fn message_dead_lettered(&self) {
        counter!(
            "queue_worker_messages_settled_total",
            "queue" => self.queue_name.clone(),
            "handler" => self.handler_name.clone(),
            "outcome" => "dead_lettered"
        )
        .increment(1);
    }

    pub fn handler_failed(&self, category: &str) {
        counter!(
            "queue_worker_handler_errors_total",
            "queue" => self.queue_name.clone(),
            "handler" => self.handler_name.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "queue_worker_in_flight",
            "queue" => self.queue_name.clone()
        )
        .set(count as f64);
    }

    pub fn lock_lost(&self) {
        counter!(
            "queue_worker_lock_lost_total",
            "queue" => self.queue_name.clone()
        )
        .increment(1);
    }
}

pub fn record_retry(policy: &str) {
    counter!("queue_worker_retries_total", "policy" => policy.to_string()).increment(1);
}

pub fn record_circuit_transition(policy: &str, state: CircuitState) {
    counter!(
        "queue_worker_circuit_breaker_transitions_total",
        "policy" => policy.to_string(),
        "state" => state.as_str()
    )
    .increment(1);
}

pub fn record_bulkhead_rejection(policy: &str) {
    counter!("queue_worker_bulkhead_rejected_total", "policy" => policy.to_string()).increment(1);
}

pub fn record_dlq_depth(queue: &str, dead_letter_count: u64, breached: bool) {
    gauge!("queue_worker_dlq_depth", "queue" => queue.to_string()).set(dead_letter_count as f64);
    gauge!("queue_worker_dlq_threshold_breached", "queue" => queue.to_string())
        .set(if breached { 1.0 } else { 0.0 });
}

pub fn record_reprocess(queue: &str, processed: u64, skipped: u64, failed: u64) {
    counter!("queue_worker_dlq_reprocessed_total", "queue" => queue.to_string(), "result" => "processed")
        .increment(processed);
    counter!("queue_worker_dlq_reprocessed_total", "queue" => queue.to_string(), "result" => "skipped")
        .increment(skipped);
    counter!("queue_worker_dlq_reprocessed_total", "queue" => queue.to_string(), "result" => "failed")
        .increment(failed);
}
