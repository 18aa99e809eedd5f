//! Delivery metrics.
//!
//! Counters, latency histograms and gauges live in memory in a
//! [`MetricsCollector`] and can be exported as Prometheus text. Every
//! delivery is also appended to `notification_metrics`, and reports are
//! computed from those rows so history survives restarts.

mod collector;
mod prometheus;
mod recorder;
mod report;

pub use collector::{
    HistogramSnapshot, LATENCY_BUCKETS_MS, MetricKey, MetricsCollector, MetricsSnapshot,
};
pub use prometheus::PrometheusExporter;
pub use recorder::{DeliveryRecord, MetricsRecorder};
pub use report::{AggregatedReport, LatencyPercentiles, ServiceReport};

/// Metric names.
pub mod names {
    /// Deliveries by `{service_id, type, status}`.
    pub const NOTIFICATIONS_TOTAL: &str = "notifications_total";
    /// Delivery latency by `{service_id, type}`.
    pub const NOTIFICATION_DURATION_MS: &str = "notification_duration_ms";
    /// Outbound HTTP requests by `{service_id, method, status}`.
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    /// Outbound HTTP latency by `{service_id, method}`.
    pub const HTTP_REQUEST_DURATION_MS: &str = "http_request_duration_ms";
    /// Queue rows by `{status}`.
    pub const QUEUE_DEPTH: &str = "queue_depth";
    /// Jobs currently being processed by the worker.
    pub const ACTIVE_JOBS: &str = "active_jobs";

    pub(crate) fn help(name: &str) -> &'static str {
        match name {
            NOTIFICATIONS_TOTAL => "Total notification deliveries",
            NOTIFICATION_DURATION_MS => "Notification delivery latency in milliseconds",
            HTTP_REQUESTS_TOTAL => "Total outbound HTTP requests",
            HTTP_REQUEST_DURATION_MS => "Outbound HTTP request latency in milliseconds",
            QUEUE_DEPTH => "Queued notifications by status",
            ACTIVE_JOBS => "Notifications currently being delivered",
            _ => "Custom metric",
        }
    }
}
