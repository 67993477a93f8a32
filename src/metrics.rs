//! Metrics helpers wrapping the `metrics` crate macros.
//!
//! No exporter is embedded; the application can install any compatible
//! recorder. Provided metrics:
//! * `meshgate_requests_total` (counter, labels: path, method, status)
//! * `meshgate_request_duration_seconds` (histogram, labels: path, method)
//! * `meshgate_instance_health_status` (gauge per instance)
//! * `meshgate_registered_instances` (gauge)
use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const MESHGATE_REQUESTS_TOTAL: &str = "meshgate_requests_total";
pub const MESHGATE_REQUEST_DURATION_SECONDS: &str = "meshgate_request_duration_seconds";
pub const MESHGATE_INSTANCE_HEALTH_STATUS: &str = "meshgate_instance_health_status";
pub const MESHGATE_REGISTERED_INSTANCES: &str = "meshgate_registered_instances";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        MESHGATE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        MESHGATE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_gauge!(
        MESHGATE_INSTANCE_HEALTH_STATUS,
        "Probed health of individual instances (1 healthy, 0 unhealthy)."
    );
    describe_gauge!(
        MESHGATE_REGISTERED_INSTANCES,
        "Number of instances currently registered."
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

/// Count one completed inbound request.
pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        MESHGATE_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(path: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        MESHGATE_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the probed health gauge for an instance.
pub fn set_instance_health(instance_id: &str, is_healthy: bool) {
    gauge!(MESHGATE_INSTANCE_HEALTH_STATUS, "instance" => instance_id.to_string())
        .set(if is_healthy { 1.0 } else { 0.0 });
}

/// Set the registered-instance gauge.
pub fn set_registered_instances(count: usize) {
    gauge!(MESHGATE_REGISTERED_INSTANCES).set(count as f64);
}
