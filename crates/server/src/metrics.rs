//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the mediarelay server:
//! - HTTP request metrics (latency, counts)
//! - Jobs by stage and status (collected dynamically)
//! - Orchestrator and worker status (collected dynamically)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "mediarelay_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mediarelay_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "mediarelay_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Job Metrics
// =============================================================================

/// Jobs by current status (collected dynamically).
pub static JOBS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("mediarelay_jobs_by_status", "Current job count by status"),
        &["status"],
    )
    .unwrap()
});

/// Jobs submitted through the API.
pub static JOBS_SUBMITTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "mediarelay_jobs_submitted_total",
        "Total jobs submitted since startup",
    )
    .unwrap()
});

/// In-flight stage executions by stage (collected dynamically).
pub static STAGES_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "mediarelay_stages_in_flight",
            "Stage executions currently in flight",
        ),
        &["stage"],
    )
    .unwrap()
});

// =============================================================================
// Orchestrator Metrics (collected dynamically)
// =============================================================================

/// Orchestrator running state (1 = running, 0 = stopped).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "mediarelay_orchestrator_running",
        "Whether the orchestrator is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Registered encoding workers.
pub static WORKERS_REGISTERED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "mediarelay_workers_registered",
        "Number of registered encoding workers",
    )
    .unwrap()
});

/// Encoding workers currently online.
pub static WORKERS_ONLINE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "mediarelay_workers_online",
        "Number of encoding workers currently online",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Jobs
    registry.register(Box::new(JOBS_BY_STATUS.clone())).unwrap();
    registry
        .register(Box::new(JOBS_SUBMITTED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(STAGES_IN_FLIGHT.clone()))
        .unwrap();

    // Orchestrator
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(WORKERS_REGISTERED.clone()))
        .unwrap();
    registry.register(Box::new(WORKERS_ONLINE.clone())).unwrap();

    // Core metrics (stages, retries, workers)
    for metric in mediarelay_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so gauges reflect the orchestrator's summary.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let status = match state.orchestrator().summary().await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("Failed to collect orchestrator metrics: {}", e);
            return;
        }
    };

    ORCHESTRATOR_RUNNING.set(if status.running { 1 } else { 0 });
    WORKERS_REGISTERED.set(status.workers_total as i64);
    WORKERS_ONLINE.set(status.workers_online as i64);

    for (label, count) in [
        ("pending", status.pending_count),
        ("running", status.running_count),
        ("awaiting_retry", status.awaiting_retry_count),
        ("done", status.done_count),
        ("failed", status.failed_count),
    ] {
        JOBS_BY_STATUS.with_label_values(&[label]).set(count as i64);
    }

    STAGES_IN_FLIGHT.reset();
    for (stage, count) in &status.in_flight_by_stage {
        STAGES_IN_FLIGHT
            .with_label_values(&[stage.as_str()])
            .set(*count as i64);
    }
}

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    let uuid_regex = regex_lite::Regex::new(
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
    )
    .unwrap();
    let numeric_regex = regex_lite::Regex::new(r"/\d+(/|$)").unwrap();

    let result = uuid_regex.replace_all(path, "{id}");
    let result = numeric_regex.replace_all(&result, "/{id}$1");
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_uuid() {
        let path = "/api/v1/jobs/550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(normalize_path(path), "/api/v1/jobs/{id}");
    }

    #[test]
    fn test_normalize_path_uuid_with_suffix() {
        let path = "/api/v1/jobs/550e8400-e29b-41d4-a716-446655440000/events";
        assert_eq!(normalize_path(path), "/api/v1/jobs/{id}/events");
    }

    #[test]
    fn test_normalize_path_numeric() {
        let path = "/api/v1/jobs/12345";
        assert_eq!(normalize_path(path), "/api/v1/jobs/{id}");
    }

    #[test]
    fn test_normalize_path_no_ids() {
        let path = "/api/v1/health";
        assert_eq!(normalize_path(path), "/api/v1/health");
    }

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("mediarelay_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_all_metrics() {
        // Prometheus only outputs metrics that have been accessed
        HTTP_REQUEST_DURATION
            .with_label_values(&["GET", "/test", "200"])
            .observe(0.1);
        HTTP_REQUESTS_IN_FLIGHT.set(0);
        JOBS_BY_STATUS.with_label_values(&["pending"]).set(0);
        JOBS_SUBMITTED_TOTAL.inc();
        ORCHESTRATOR_RUNNING.set(0);
        WORKERS_ONLINE.set(0);
        mediarelay_core::metrics::FALLBACKS_APPLIED.inc();

        let output = encode_metrics();

        assert!(output.contains("mediarelay_http_request_duration_seconds"));
        assert!(output.contains("mediarelay_http_requests_in_flight"));
        assert!(output.contains("mediarelay_jobs_by_status"));
        assert!(output.contains("mediarelay_jobs_submitted_total"));
        assert!(output.contains("mediarelay_orchestrator_running"));
        assert!(output.contains("mediarelay_workers_online"));
        assert!(output.contains("mediarelay_fallbacks_applied_total"));
    }
}
