//! In-process metric storage.
//!
//! Counters, latency histograms and gauges keyed by metric name plus a
//! sorted label set. All updates are lock-free apart from DashMap's shard
//! locks on first insertion.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Upper bounds (inclusive, milliseconds) of the latency histogram buckets.
pub const LATENCY_BUCKETS_MS: [u64; 12] = [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

/// Metric identity: name plus labels sorted by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl MetricKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct Histogram {
    /// Per-bucket (non-cumulative) counts; the last slot is `+Inf`.
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_ms: u64) {
        let index = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = self
            .buckets
            .iter()
            .map(|b| {
                cumulative += b.load(Ordering::Relaxed);
                cumulative
            })
            .collect();
        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time histogram values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Cumulative counts aligned with [`LATENCY_BUCKETS_MS`], then `+Inf`.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
}

/// Metrics collector.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<MetricKey, AtomicU64>,
    histograms: DashMap<MetricKey, Histogram>,
    /// `f64` bit patterns.
    gauges: DashMap<MetricKey, AtomicU64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        self.counters
            .entry(MetricKey::new(name, labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    pub fn observe_ms(&self, name: &str, labels: &[(&str, &str)], value_ms: u64) {
        self.histograms
            .entry(MetricKey::new(name, labels))
            .or_insert_with(Histogram::new)
            .observe(value_ms);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .entry(MetricKey::new(name, labels))
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&MetricKey::new(name, labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .get(&MetricKey::new(name, labels))
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        self.histograms
            .get(&MetricKey::new(name, labels))
            .map(|h| h.snapshot())
    }

    /// Copy of every metric, sorted by key.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<_> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        counters.sort();

        let mut histograms: Vec<_> = self
            .histograms
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        histograms.sort_by(|a, b| a.0.cmp(&b.0));

        let mut gauges: Vec<_> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), f64::from_bits(e.value().load(Ordering::Relaxed))))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSnapshot {
            counters,
            histograms,
            gauges,
        }
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(MetricKey, u64)>,
    pub histograms: Vec<(MetricKey, HistogramSnapshot)>,
    pub gauges: Vec<(MetricKey, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_label_set() {
        let collector = MetricsCollector::new();
        collector.increment_counter("sent", &[("service_id", "discord"), ("status", "success")], 1);
        collector.increment_counter("sent", &[("status", "success"), ("service_id", "discord")], 2);
        collector.increment_counter("sent", &[("service_id", "discord"), ("status", "failed")], 1);

        assert_eq!(
            collector.counter("sent", &[("service_id", "discord"), ("status", "success")]),
            3
        );
        assert_eq!(
            collector.counter("sent", &[("service_id", "discord"), ("status", "failed")]),
            1
        );
        assert_eq!(collector.counter("sent", &[("service_id", "telegram")]), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let collector = MetricsCollector::new();
        for ms in [1, 5, 6, 300, 60_000] {
            collector.observe_ms("latency", &[], ms);
        }
        let h = collector.histogram("latency", &[]).unwrap();
        assert_eq!(h.count, 5);
        assert_eq!(h.sum_ms, 60_312);
        assert_eq!(h.buckets[0], 2); // <= 5
        assert_eq!(h.buckets[1], 3); // <= 10
        assert_eq!(h.buckets[6], 4); // <= 500
        assert_eq!(*h.buckets.last().unwrap(), 5);
    }

    #[test]
    fn test_gauges_overwrite() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.gauge("depth", &[("status", "pending")]), None);
        collector.set_gauge("depth", &[("status", "pending")], 4.0);
        collector.set_gauge("depth", &[("status", "pending")], 2.5);
        assert_eq!(collector.gauge("depth", &[("status", "pending")]), Some(2.5));
    }

    #[test]
    fn test_snapshot_sorted() {
        let collector = MetricsCollector::new();
        collector.increment_counter("b", &[], 1);
        collector.increment_counter("a", &[], 1);
        let snapshot = collector.snapshot();
        let names: Vec<_> = snapshot.counters.iter().map(|(k, _)| k.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
