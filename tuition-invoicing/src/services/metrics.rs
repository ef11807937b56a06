//! Prometheus metrics for tuition-invoicing.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// HTTP request counter by route and status.
pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tuition_http_requests_total",
        "Total number of HTTP requests",
        &["method", "status"]
    )
    .expect("Failed to register http_requests_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tuition_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Commit counter by mode and outcome.
pub static COMMITS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tuition_commits_total",
        "Total number of line-item commits",
        &["mode", "outcome"] // success, partial, rolled_back
    )
    .expect("Failed to register commits_total")
});

/// Individual commit operations by type and status.
pub static COMMIT_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tuition_commit_operations_total",
        "Total number of storage operations issued by commits",
        &["operation", "status"]
    )
    .expect("Failed to register commit_operations_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tuition_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&COMMITS_TOTAL);
    Lazy::force(&COMMIT_OPERATIONS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
}

pub fn record_commit(mode: &str, outcome: &str) {
    COMMITS_TOTAL.with_label_values(&[mode, outcome]).inc();
}

pub fn record_commit_operation(operation: &str, status: &str) {
    COMMIT_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
