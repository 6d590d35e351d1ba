//! Prometheus metrics for the volume registry
//!
//! Counts registry and provisioning operations and tracks how many volume
//! records are live.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: registry operations by type and status
    pub const OPERATIONS_TOTAL: &str = "volume_agent_operations_total";
    /// Histogram: duration of registry operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "volume_agent_operation_duration_seconds";
    /// Gauge: volume records that are not soft-deleted
    pub const VOLUMES_TOTAL: &str = "volume_agent_volumes_total";
}

/// Install the Prometheus exporter, serving `/metrics` on `addr`.
///
/// Metrics from every crate in the process share this recorder.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn set_volumes_count(count: usize) {
    gauge!(names::VOLUMES_TOTAL).set(count as f64);
}

/// Times one operation; finish with [`success`](Self::success) or
/// [`failure`](Self::failure).
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        record_operation(self.operation, "success", self.start.elapsed().as_secs_f64());
    }

    pub fn failure(self, error_code: &str) {
        record_operation(self.operation, error_code, self.start.elapsed().as_secs_f64());
    }
}
