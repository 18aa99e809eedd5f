//! Aggregated delivery reports.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::MetricsSampleDbModel;

/// Latency summary in milliseconds. Percentiles use the nearest-rank method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub min: i64,
    pub max: i64,
    pub avg: f64,
    pub p50: i64,
    pub p90: i64,
    pub p95: i64,
    pub p99: i64,
}

impl LatencyPercentiles {
    fn from_durations(mut durations: Vec<i64>) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        durations.sort_unstable();
        let sum: i64 = durations.iter().sum();
        Self {
            min: durations[0],
            max: durations[durations.len() - 1],
            avg: sum as f64 / durations.len() as f64,
            p50: nearest_rank(&durations, 50.0),
            p90: nearest_rank(&durations, 90.0),
            p95: nearest_rank(&durations, 95.0),
            p99: nearest_rank(&durations, 99.0),
        }
    }
}

/// `sorted` must be non-empty and ascending.
fn nearest_rank(sorted: &[i64], percentile: f64) -> i64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn success_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    }
}

/// Per-service slice of a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Fraction in `[0, 1]`.
    pub success_rate: f64,
    pub latency: LatencyPercentiles,
}

/// Delivery statistics over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Fraction in `[0, 1]`.
    pub success_rate: f64,
    pub latency: LatencyPercentiles,
    pub services: BTreeMap<String, ServiceReport>,
    /// Failed deliveries by error message, most frequent first.
    pub top_errors: Vec<(String, u64)>,
}

/// Number of distinct error messages kept in a report.
const TOP_ERRORS: usize = 10;

impl AggregatedReport {
    pub fn from_samples(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        samples: &[MetricsSampleDbModel],
    ) -> Self {
        let mut per_service: BTreeMap<String, (u64, Vec<i64>)> = BTreeMap::new();
        let mut errors: BTreeMap<String, u64> = BTreeMap::new();
        let mut successful = 0u64;

        for sample in samples {
            let entry = per_service.entry(sample.service_id.clone()).or_default();
            entry.1.push(sample.duration_ms);
            if sample.is_success() {
                successful += 1;
                entry.0 += 1;
            } else if let Some(message) = &sample.error_message {
                *errors.entry(message.clone()).or_default() += 1;
            }
        }

        let services = per_service
            .into_iter()
            .map(|(service_id, (ok, durations))| {
                let total = durations.len() as u64;
                let report = ServiceReport {
                    total,
                    successful: ok,
                    failed: total - ok,
                    success_rate: success_rate(ok, total),
                    latency: LatencyPercentiles::from_durations(durations),
                };
                (service_id, report)
            })
            .collect();

        let mut top_errors: Vec<(String, u64)> = errors.into_iter().collect();
        top_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_errors.truncate(TOP_ERRORS);

        let total = samples.len() as u64;
        Self {
            start,
            end,
            total,
            successful,
            failed: total - successful,
            success_rate: success_rate(successful, total),
            latency: LatencyPercentiles::from_durations(
                samples.iter().map(|s| s.duration_ms).collect(),
            ),
            services,
            top_errors,
        }
    }
}
