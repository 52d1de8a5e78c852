//! Prometheus metrics for the connection manager, publisher and worker.

use ::metrics::{counter, histogram};
use std::time::Duration;

/// Connection lifecycle counters, labeled by backend.
#[derive(Clone)]
pub struct ConnectionMetrics {
    backend: &'static str,
}

impl ConnectionMetrics {
    pub fn new(backend: &'static str) -> Self {
        Self { backend }
    }

    pub fn connected(&self) {
        counter!("messaging_connections_opened_total", "backend" => self.backend).increment(1);
    }

    pub fn connect_failed(&self, category: &'static str) {
        counter!(
            "messaging_connection_failures_total",
            "backend" => self.backend,
            "category" => category
        )
        .increment(1);
    }

    pub fn invalidated(&self) {
        counter!("messaging_connections_broken_total", "backend" => self.backend).increment(1);
    }
}

/// Publish outcomes, labeled by queue.
#[derive(Clone)]
pub struct PublisherMetrics {
    queue: String,
}

impl PublisherMetrics {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
        }
    }

    pub fn published(&self) {
        counter!("messaging_publish_delivered_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn retried(&self) {
        counter!("messaging_publish_retried_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn dropped(&self, reason: &'static str) {
        counter!(
            "messaging_publish_dropped_total",
            "queue" => self.queue.clone(),
            "reason" => reason
        )
        .increment(1);
    }
}

/// Per-delivery counters, labeled by queue and processor.
#[derive(Clone)]
pub struct WorkerMetrics {
    queue: String,
    processor: String,
}

impl WorkerMetrics {
    pub fn new(queue: &str, processor: &str) -> Self {
        Self {
            queue: queue.to_string(),
            processor: processor.to_string(),
        }
    }

    pub fn received(&self) {
        counter!(
            "messaging_deliveries_received_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);
    }

    pub fn acked(&self, duration: Duration) {
        counter!(
            "messaging_deliveries_acked_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);

        histogram!(
            "messaging_delivery_duration_seconds",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn requeued(&self) {
        counter!(
            "messaging_deliveries_requeued_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone()
        )
        .increment(1);
    }

    /// Acked without effect: malformed payload or permanent processing error.
    pub fn dropped(&self, reason: &'static str) {
        counter!(
            "messaging_deliveries_dropped_total",
            "queue" => self.queue.clone(),
            "processor" => self.processor.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn reconnected(&self) {
        counter!("messaging_worker_reconnects_total", "queue" => self.queue.clone()).increment(1);
    }
}

/// Install the global Prometheus recorder.
///
/// Fails if a recorder is already installed in this process.
pub fn init_metrics(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, metrics_exporter_prometheus::BuildError>
{
    metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
}
