//! Prometheus metrics for host-side driver calls
//!
//! The exporter itself is installed by
//! [`volume_agent::metrics::init_metrics`]; both crates record into the same
//! process-wide recorder.

use std::time::Instant;

use metrics::{counter, histogram};

use crate::driver::DriverError;

/// Metric names
pub mod names {
    /// Counter: driver calls by driver, operation and status
    pub const DRIVER_OPERATIONS_TOTAL: &str = "volume_client_driver_operations_total";
    /// Histogram: duration of driver calls in seconds
    pub const DRIVER_OPERATION_DURATION_SECONDS: &str =
        "volume_client_driver_operation_duration_seconds";
}

pub fn record_driver_operation(driver: &'static str, operation: &'static str, status: &str, duration_secs: f64) {
    counter!(names::DRIVER_OPERATIONS_TOTAL, "driver" => driver, "operation" => operation, "status" => status.to_string())
        .increment(1);
    histogram!(names::DRIVER_OPERATION_DURATION_SECONDS, "driver" => driver, "operation" => operation)
        .record(duration_secs);
}

/// Run one driver call and record its outcome.
pub fn observe<T>(
    driver: &'static str,
    operation: &'static str,
    call: impl FnOnce() -> Result<T, DriverError>,
) -> Result<T, DriverError> {
    let start = Instant::now();
    let result = call();
    let status = match &result {
        Ok(_) => "success",
        Err(e) => e.code(),
    };
    record_driver_operation(driver, operation, status, start.elapsed().as_secs_f64());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_passes_result_through() {
        // No recorder installed: recording is a no-op
        assert_eq!(observe("memory", "discover", || Ok(3)).unwrap(), 3);
        let err = observe::<()>("memory", "discover", || {
            Err(DriverError::DeviceNotFound("/dev/x".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, DriverError::DeviceNotFound(_)));
    }
}
