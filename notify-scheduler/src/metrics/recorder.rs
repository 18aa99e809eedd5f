//! Metrics recorder.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use super::collector::MetricsCollector;
use super::names;
use super::report::AggregatedReport;
use crate::Result;
use crate::database::models::{Metadata, NewMetricsSample, SampleStatus, encode};
use crate::database::repositories::MetricsRepository;
use crate::database::time::{datetime_to_ms, now_ms};
use crate::dispatch::Outcome;
use crate::endpoint::{EndpointUrl, HttpObserver};
use crate::notification::NotifyType;

/// One delivery outcome with its context.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRecord<'a> {
    pub job_id: Option<i64>,
    pub scheduled_job_id: Option<i64>,
    /// Raw service URL; only the redacted form is stored.
    pub service_url: &'a str,
    pub notify_type: NotifyType,
    pub outcome: &'a Outcome,
    pub metadata: Option<&'a Metadata>,
}

fn redact(url: &str) -> String {
    match EndpointUrl::parse(url) {
        Ok(url) => url.redacted(),
        Err(_) => match url.split_once("://") {
            Some((scheme, _)) => format!("{scheme}://****"),
            None => "****".to_string(),
        },
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Records deliveries into the in-memory collector and the sample table.
#[derive(Clone)]
pub struct MetricsRecorder {
    collector: Arc<MetricsCollector>,
    repo: Arc<dyn MetricsRepository>,
}

impl MetricsRecorder {
    pub fn new(collector: Arc<MetricsCollector>, repo: Arc<dyn MetricsRepository>) -> Self {
        Self { collector, repo }
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    /// Count the delivery, observe its latency and append a durable sample.
    pub async fn record_delivery(&self, record: &DeliveryRecord<'_>) -> Result<i64> {
        self.record_delivery_at(record, now_ms()).await
    }

    pub async fn record_delivery_at(&self, record: &DeliveryRecord<'_>, timestamp: i64) -> Result<i64> {
        let outcome = record.outcome;
        let status = SampleStatus::from_success(outcome.success);
        let notify_type = record.notify_type.as_str();
        let duration_ms = millis(outcome.duration);

        self.collector.increment_counter(
            names::NOTIFICATIONS_TOTAL,
            &[
                ("service_id", outcome.service_id.as_str()),
                ("type", notify_type),
                ("status", status.as_str()),
            ],
            1,
        );
        self.collector.observe_ms(
            names::NOTIFICATION_DURATION_MS,
            &[("service_id", outcome.service_id.as_str()), ("type", notify_type)],
            duration_ms,
        );

        let metadata = match record.metadata {
            Some(metadata) => encode(metadata)?,
            None => "{}".to_string(),
        };
        let sample = NewMetricsSample {
            job_id: record.job_id,
            scheduled_job_id: record.scheduled_job_id,
            service_id: outcome.service_id.clone(),
            service_url: redact(record.service_url),
            notification_type: notify_type.to_string(),
            status,
            duration_ms: i64::try_from(duration_ms).unwrap_or(i64::MAX),
            error_message: outcome.error.as_ref().map(|e| e.to_string()),
            metadata,
            timestamp,
        };

        let id = self.repo.append(&sample).await?;
        trace!(
            sample_id = id,
            service = %sample.service_id,
            status = %status,
            duration_ms,
            "Recorded delivery"
        );
        Ok(id)
    }

    /// Count one outbound HTTP request.
    pub fn record_http_request(&self, service_id: &str, method: &str, status: u16, duration: Duration) {
        let status = status.to_string();
        self.collector.increment_counter(
            names::HTTP_REQUESTS_TOTAL,
            &[("service_id", service_id), ("method", method), ("status", status.as_str())],
            1,
        );
        self.collector.observe_ms(
            names::HTTP_REQUEST_DURATION_MS,
            &[("service_id", service_id), ("method", method)],
            millis(duration),
        );
    }

    pub fn update_gauge(&self, name: &str, value: f64) {
        self.collector.set_gauge(name, &[], value);
    }

    pub fn update_gauge_with_labels(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.collector.set_gauge(name, labels, value);
    }

    /// Aggregate durable samples in `[start, end)`.
    pub async fn report(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<AggregatedReport> {
        let samples = self
            .repo
            .list_between(datetime_to_ms(start), datetime_to_ms(end))
            .await?;
        Ok(AggregatedReport::from_samples(start, end, &samples))
    }

    /// Delete samples older than `older_than`.
    pub async fn purge(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now_ms().saturating_sub(i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX));
        self.repo.purge(cutoff).await
    }
}

impl HttpObserver for MetricsRecorder {
    fn on_request(&self, service_id: &str, method: &str, status: u16, elapsed: Duration) {
        self.record_http_request(service_id, method, status, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxMetricsRepository;
    use crate::database::test_pool;
    use crate::error::DeliveryError;
    use chrono::TimeZone;

    async fn recorder() -> MetricsRecorder {
        let pool = test_pool().await;
        MetricsRecorder::new(
            Arc::new(MetricsCollector::new()),
            Arc::new(SqlxMetricsRepository::new(pool)),
        )
    }

    fn record<'a>(url: &'a str, outcome: &'a Outcome) -> DeliveryRecord<'a> {
        DeliveryRecord {
            job_id: Some(1),
            scheduled_job_id: None,
            service_url: url,
            notify_type: NotifyType::Warning,
            outcome,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_record_delivery_counts_and_persists() {
        let recorder = recorder().await;
        let ok = Outcome::succeeded("discord", Duration::from_millis(120));
        let failed = Outcome::failed(
            "tgram",
            DeliveryError::transient("502 Bad Gateway"),
            Duration::from_millis(80),
        );

        let base = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let ts = datetime_to_ms(base);
        recorder
            .record_delivery_at(&record("discord://1234/secret-token", &ok), ts)
            .await
            .unwrap();
        recorder
            .record_delivery_at(&record("tgram://99:secret/42", &failed), ts + 1)
            .await
            .unwrap();

        let collector = recorder.collector();
        assert_eq!(
            collector.counter(
                names::NOTIFICATIONS_TOTAL,
                &[("service_id", "discord"), ("type", "warning"), ("status", "success")]
            ),
            1
        );
        assert_eq!(
            collector
                .histogram(
                    names::NOTIFICATION_DURATION_MS,
                    &[("service_id", "tgram"), ("type", "warning")]
                )
                .unwrap()
                .sum_ms,
            80
        );

        let report = recorder
            .report(base, base + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.services["tgram"].failed, 1);

        let samples = recorder.repo.list_between(ts, ts + 2).await.unwrap();
        assert!(samples.iter().all(|s| !s.service_url.contains("secret")));
        assert_eq!(
            samples[1].error_message.as_deref(),
            Some("transient delivery failure: 502 Bad Gateway")
        );

        // Outside the window.
        let empty = recorder
            .report(base - chrono::Duration::hours(1), base)
            .await
            .unwrap();
        assert_eq!(empty.total, 0);
    }

    #[tokio::test]
    async fn test_http_and_gauges() {
        let recorder = recorder().await;
        recorder.record_http_request("webhook", "POST", 200, Duration::from_millis(15));
        recorder.record_http_request("webhook", "POST", 200, Duration::from_millis(15));
        recorder.update_gauge(names::ACTIVE_JOBS, 3.0);
        recorder.update_gauge_with_labels(names::QUEUE_DEPTH, &[("status", "pending")], 7.0);

        let collector = recorder.collector();
        assert_eq!(
            collector.counter(
                names::HTTP_REQUESTS_TOTAL,
                &[("service_id", "webhook"), ("method", "POST"), ("status", "200")]
            ),
            2
        );
        assert_eq!(collector.gauge(names::ACTIVE_JOBS, &[]), Some(3.0));
        assert_eq!(
            collector.gauge(names::QUEUE_DEPTH, &[("status", "pending")]),
            Some(7.0)
        );
    }

    #[test]
    fn test_redact_invalid_url() {
        assert_eq!(redact("not a url"), "****");
        assert_eq!(redact("1x://secret"), "1x://****");
    }
}
