/// Metrics and telemetry for the family portal
///
/// Prometheus-compatible metrics for monitoring:
/// - Media job outcomes and queue depth
/// - Push delivery outcomes and queue depth
/// - Chat traffic and live connections
/// - Background job execution

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== Media Metrics ==========

    /// Media jobs by outcome (active, failed, abandoned, rejected)
    pub static ref MEDIA_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "media_jobs_total",
        "Total number of media jobs by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Media jobs waiting in the queue
    pub static ref MEDIA_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "media_queue_depth",
        "Number of media jobs waiting to be processed"
    )
    .unwrap();

    /// Time spent transcoding and publishing one image
    pub static ref MEDIA_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "media_job_duration_seconds",
        "Media job processing time in seconds",
        &["outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    // ========== Push Metrics ==========

    /// Push deliveries by outcome (delivered, token_rejected, failed)
    pub static ref PUSH_DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "push_deliveries_total",
        "Total number of push delivery attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Push jobs waiting in the queue
    pub static ref PUSH_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "push_queue_depth",
        "Number of push jobs waiting to be delivered"
    )
    .unwrap();

    // ========== Chat Metrics ==========

    /// Chat messages by action (created, deleted)
    pub static ref CHAT_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "chat_messages_total",
        "Total number of chat message actions",
        &["action"]
    )
    .unwrap();

    /// Registered live connections
    pub static ref CHAT_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "chat_connections_active",
        "Number of live chat connections"
    )
    .unwrap();

    /// Connections dropped by the registry (backpressure, stale)
    pub static ref CHAT_CONNECTIONS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "chat_connections_dropped_total",
        "Total number of chat connections dropped by the registry",
        &["reason"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record the outcome of one media job
pub fn record_media_job(outcome: &str, duration: f64) {
    MEDIA_JOBS_TOTAL.with_label_values(&[outcome]).inc();
    MEDIA_JOB_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration);
}

/// Record a media submission turned away by a full queue
pub fn record_media_rejected() {
    MEDIA_JOBS_TOTAL.with_label_values(&["rejected"]).inc();
}

/// Record one push delivery attempt
pub fn record_push_delivery(outcome: &str) {
    PUSH_DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a chat message action
pub fn record_chat_message(action: &str) {
    CHAT_MESSAGES_TOTAL.with_label_values(&[action]).inc();
}

/// Record a connection the registry closed on its own
pub fn record_connection_dropped(reason: &str) {
    CHAT_CONNECTIONS_DROPPED_TOTAL
        .with_label_values(&[reason])
        .inc();
}

/// Record a background job run
pub fn record_background_job(job_type: &str, status: &str) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}
