//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Stage executions and their duration
//! - Retry decisions, fallbacks and transport errors
//! - Job outcomes and worker liveness

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Stage Metrics
// =============================================================================

/// Stage executions by stage and result.
pub static STAGE_EXECUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mediarelay_stage_executions_total",
            "Total stage executions",
        ),
        &["stage", "result"], // "success", "failure", "cancelled"
    )
    .unwrap()
});

/// Stage execution duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "mediarelay_stage_duration_seconds",
            "Duration of a single stage execution",
        )
        .buckets(vec![
            0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0,
        ]),
        &["stage"],
    )
    .unwrap()
});

/// Encode dispatches by worker class.
pub static ENCODE_DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mediarelay_encode_dispatches_total",
            "Encode dispatches by worker class",
        ),
        &["class"],
    )
    .unwrap()
});

// =============================================================================
// Retry Metrics
// =============================================================================

/// Retry policy decisions.
pub static RETRY_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mediarelay_retry_decisions_total",
            "Retry policy decisions by stage",
        ),
        &["stage", "decision"],
    )
    .unwrap()
});

/// Worker class fallbacks applied.
pub static FALLBACKS_APPLIED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "mediarelay_fallbacks_applied_total",
        "Encode worker class fallbacks applied",
    )
    .unwrap()
});

/// Transport errors talking to encoding workers.
pub static TRANSPORT_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mediarelay_transport_errors_total",
            "Transport errors by worker",
        ),
        &["worker"],
    )
    .unwrap()
});

// =============================================================================
// Job & Worker Metrics
// =============================================================================

/// Jobs reaching a terminal state.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mediarelay_jobs_finished_total", "Jobs reaching a terminal state"),
        &["result", "error_kind"], // result: "done", "failed"
    )
    .unwrap()
});

/// Worker liveness transitions.
pub static WORKER_LIVENESS_CHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "mediarelay_worker_liveness_changes_total",
            "Worker liveness transitions",
        ),
        &["worker", "to"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Stages
        Box::new(STAGE_EXECUTIONS.clone()),
        Box::new(STAGE_DURATION.clone()),
        Box::new(ENCODE_DISPATCHES.clone()),
        // Retry
        Box::new(RETRY_DECISIONS.clone()),
        Box::new(FALLBACKS_APPLIED.clone()),
        Box::new(TRANSPORT_ERRORS.clone()),
        // Jobs and workers
        Box::new(JOBS_FINISHED.clone()),
        Box::new(WORKER_LIVENESS_CHANGES.clone()),
    ]
}
