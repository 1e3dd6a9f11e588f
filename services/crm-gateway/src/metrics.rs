//! Prometheus metrics exposition
//!
//! Metrics recorded by the gateway binary:
//!
//! - `gateway_requests_total` (counter): labels `operation`, `status`
//! - `gateway_auth_failures_total` (counter): label `reason`
//!
//! The library crates record `gateway_operation_duration_seconds` (histogram,
//! label `operation`) and `gateway_token_refresh_total` (counter, label
//! `outcome`) through the same facade.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms to 60s, covering the upstream timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_operation_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// The duration histogram gets explicit buckets so it renders `_bucket` lines
/// rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Handle backed by a recorder that is not installed globally.
#[cfg(test)]
pub fn detached_handle() -> PrometheusHandle {
    builder().unwrap().build_recorder().handle()
}

/// Record a completed public request.
pub fn record_request(operation: &str, status: u16) {
    metrics::counter!(
        "gateway_requests_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a rejected authentication attempt.
pub fn record_auth_failure(reason: &'static str) {
    metrics::counter!("gateway_auth_failures_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("contacts.get", 200);
        record_auth_failure("invalid_key");
    }

    #[test]
    fn request_and_auth_counters_carry_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("contacts.get", 200);
        record_request("contacts.get", 404);
        record_auth_failure("rate_limited");

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("operation=\"contacts.get\""));
        assert!(output.contains("status=\"404\""));
        assert!(output.contains("gateway_auth_failures_total"));
        assert!(output.contains("reason=\"rate_limited\""));
    }

    #[test]
    fn duration_histogram_renders_buckets() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::histogram!("gateway_operation_duration_seconds", "operation" => "contacts.get")
            .record(0.003);

        let output = handle.render();
        assert!(output.contains("gateway_operation_duration_seconds_bucket"));
        assert!(output.contains("le=\"0.005\""), "5ms bucket must exist");
        assert!(output.contains("le=\"60\""), "60s bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }
}
