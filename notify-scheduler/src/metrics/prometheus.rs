//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::fmt::Write;
use std::sync::Arc;

use super::collector::{LATENCY_BUCKETS_MS, MetricsCollector};
use super::names;

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "notify_scheduler")
    }

    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();
        let mut last_name: Option<&str> = None;

        for (key, value) in &snapshot.counters {
            if last_name != Some(key.name.as_str()) {
                self.write_header(&mut output, &key.name, "counter");
                last_name = Some(&key.name);
            }
            self.write_sample(&mut output, &key.name, &key.labels, None, *value as f64);
        }

        last_name = None;
        for (key, histogram) in &snapshot.histograms {
            if last_name != Some(key.name.as_str()) {
                self.write_header(&mut output, &key.name, "histogram");
                last_name = Some(&key.name);
            }
            let bucket_name = format!("{}_bucket", key.name);
            for (bound, count) in LATENCY_BUCKETS_MS.iter().zip(&histogram.buckets) {
                self.write_sample(
                    &mut output,
                    &bucket_name,
                    &key.labels,
                    Some(&bound.to_string()),
                    *count as f64,
                );
            }
            self.write_sample(
                &mut output,
                &bucket_name,
                &key.labels,
                Some("+Inf"),
                histogram.count as f64,
            );
            self.write_sample(
                &mut output,
                &format!("{}_sum", key.name),
                &key.labels,
                None,
                histogram.sum_ms as f64,
            );
            self.write_sample(
                &mut output,
                &format!("{}_count", key.name),
                &key.labels,
                None,
                histogram.count as f64,
            );
        }

        last_name = None;
        for (key, value) in &snapshot.gauges {
            if last_name != Some(key.name.as_str()) {
                self.write_header(&mut output, &key.name, "gauge");
                last_name = Some(&key.name);
            }
            self.write_sample(&mut output, &key.name, &key.labels, None, *value);
        }

        output
    }

    fn write_header(&self, output: &mut String, name: &str, kind: &str) {
        let full_name = format!("{}_{}", self.namespace, name);
        let _ = writeln!(output, "# HELP {} {}", full_name, names::help(name));
        let _ = writeln!(output, "# TYPE {} {}", full_name, kind);
    }

    fn write_sample(
        &self,
        output: &mut String,
        name: &str,
        labels: &[(String, String)],
        le: Option<&str>,
        value: f64,
    ) {
        let mut pairs: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        if let Some(le) = le {
            pairs.push(format!("le=\"{}\"", le));
        }

        if pairs.is_empty() {
            let _ = writeln!(output, "{}_{} {}", self.namespace, name, value);
        } else {
            let _ = writeln!(
                output,
                "{}_{}{{{}}} {}",
                self.namespace,
                name,
                pairs.join(","),
                value
            );
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
