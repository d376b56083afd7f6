//! Metrics and observability utilities
//!
//! Prometheus-style metrics for the reasoning pipeline with
//! standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all DocForge metrics
pub const METRICS_PREFIX: &str = "docforge";

/// Buckets for LLM and stage latency (in seconds)
pub const STAGE_BUCKETS: &[f64] = &[
    0.001,  // 1ms - heuristic paths
    0.010,  // 10ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s - LLM call timeout
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_sessions_started_total", METRICS_PREFIX),
        Unit::Count,
        "Total reasoning sessions started"
    );

    describe_counter!(
        format!("{}_sessions_finished_total", METRICS_PREFIX),
        Unit::Count,
        "Reasoning sessions that completed or failed"
    );

    describe_counter!(
        format!("{}_sessions_suspended_total", METRICS_PREFIX),
        Unit::Count,
        "Suspensions awaiting caller input, by stage"
    );

    describe_gauge!(
        format!("{}_sessions_active", METRICS_PREFIX),
        Unit::Count,
        "Sessions currently held in the registry"
    );

    describe_histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Pipeline stage latency in seconds"
    );

    describe_counter!(
        format!("{}_llm_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total LLM generation requests"
    );

    describe_histogram!(
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "LLM generation latency in seconds"
    );

    describe_counter!(
        format!("{}_llm_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total LLM generation errors"
    );

    describe_counter!(
        format!("{}_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Stages that fell back to deterministic heuristics"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record LLM metrics
pub fn record_llm(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_llm_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_llm_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    } else {
        counter!(
            format!("{}_llm_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }
}

/// Helper to record a pipeline stage run
pub fn record_stage(stage: &str, duration_secs: f64) {
    histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .record(duration_secs);
}

/// Helper to record a heuristic fallback
pub fn record_fallback(stage: &str) {
    counter!(
        format!("{}_fallbacks_total", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Helper to record session lifecycle
pub fn record_session_started() {
    counter!(format!("{}_sessions_started_total", METRICS_PREFIX)).increment(1);
}

pub fn record_session_finished(outcome: &str) {
    counter!(
        format!("{}_sessions_finished_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_session_suspended(stage: &str) {
    counter!(
        format!("{}_sessions_suspended_total", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!(format!("{}_sessions_active", METRICS_PREFIX)).set(count as f64);
}
