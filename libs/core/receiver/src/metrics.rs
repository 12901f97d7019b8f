//! Prometheus metrics for receivers
//!
//! Counters mirror [`crate::ReceiverStatistics`] so operators can scrape the
//! same numbers the receiver reports in its logs.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. A failure to
/// install the recorder is logged; metrics are then dropped.
pub fn init_metrics() {
    let installed = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });
    if let Err(e) = installed {
        warn!(error = %e, "Failed to install Prometheus recorder");
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Metrics helper labelled with the receiver and listener names
#[derive(Debug, Clone)]
pub struct ReceiverMetrics {
    receiver: String,
    listener: String,
}

impl ReceiverMetrics {
    pub fn new(receiver: impl Into<String>, listener: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            listener: listener.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "receiver_messages_received_total",
            "receiver" => self.receiver.clone(),
            "listener" => self.listener.clone()
        )
        .increment(1);
    }

    pub fn message_retried(&self) {
        counter!(
            "receiver_messages_retried_total",
            "receiver" => self.receiver.clone(),
            "listener" => self.listener.clone()
        )
        .increment(1);
    }

    pub fn message_rejected(&self, reason: &'static str) {
        counter!(
            "receiver_messages_rejected_total",
            "receiver" => self.receiver.clone(),
            "listener" => self.listener.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn message_quarantined(&self) {
        counter!(
            "receiver_messages_quarantined_total",
            "receiver" => self.receiver.clone(),
            "listener" => self.listener.clone()
        )
        .increment(1);
    }

    pub fn message_processed(&self, duration: Duration, status: &'static str) {
        counter!(
            "receiver_messages_processed_total",
            "receiver" => self.receiver.clone(),
            "listener" => self.listener.clone(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "receiver_message_duration_seconds",
            "receiver" => self.receiver.clone(),
            "listener" => self.listener.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn fetch_error(&self) {
        counter!(
            "receiver_fetch_errors_total",
            "receiver" => self.receiver.clone(),
            "listener" => self.listener.clone()
        )
        .increment(1);
    }

    pub fn threads_processing(&self, count: usize) {
        gauge!(
            "receiver_threads_processing",
            "receiver" => self.receiver.clone()
        )
        .set(count as f64);
    }

    pub fn threads_running(&self, count: usize) {
        gauge!(
            "receiver_threads_running",
            "receiver" => self.receiver.clone()
        )
        .set(count as f64);
    }

    pub fn retry_interval(&self, interval: Duration) {
        gauge!(
            "receiver_retry_interval_seconds",
            "receiver" => self.receiver.clone()
        )
        .set(interval.as_secs_f64());
    }
}
