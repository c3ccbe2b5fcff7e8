//! Push exporter that keeps the last collection rendered in the Prometheus text format, so the
//! `/metrics` handler only has to hand out a string.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::Temporality;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use parking_lot::RwLock;

#[derive(Clone, Default)]
pub struct PrometheusExporter {
    rendered: Arc<RwLock<Option<String>>>,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics of the last export, `None` until the first periodic collection ran.
    pub fn get_metrics(&self) -> Option<String> {
        self.rendered.read().clone()
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}

fn format_labels<'a>(
    attributes: impl Iterator<Item = &'a KeyValue>,
    extra: Option<String>,
) -> String {
    let labels = attributes
        .map(|kv| {
            format!(
                "{}=\"{}\"",
                kv.key.as_str(),
                escape_label_value(&kv.value.to_string())
            )
        })
        .chain(extra)
        .collect::<Vec<_>>();
    if labels.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", labels.join(","))
    }
}

fn render_data<T: Copy>(
    out: &mut String,
    name: &str,
    data: &MetricData<T>,
    to_f64: impl Fn(T) -> f64,
) {
    match data {
        MetricData::Sum(sum) => {
            let kind = if sum.is_monotonic() { "counter" } else { "gauge" };
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for point in sum.data_points() {
                let labels = format_labels(point.attributes(), None);
                let _ = writeln!(out, "{name}{labels} {}", to_f64(point.value()));
            }
        }
        MetricData::Gauge(gauge) => {
            let _ = writeln!(out, "# TYPE {name} gauge");
            for point in gauge.data_points() {
                let labels = format_labels(point.attributes(), None);
                let _ = writeln!(out, "{name}{labels} {}", to_f64(point.value()));
            }
        }
        MetricData::Histogram(histogram) => {
            let _ = writeln!(out, "# TYPE {name} histogram");
            for point in histogram.data_points() {
                let bounds = point.bounds().collect::<Vec<_>>();
                let mut cumulative = 0u64;
                for (i, count) in point.bucket_counts().enumerate() {
                    cumulative += count;
                    let le = bounds
                        .get(i)
                        .map_or_else(|| "+Inf".to_string(), |b| b.to_string());
                    let labels = format_labels(point.attributes(), Some(format!("le=\"{le}\"")));
                    let _ = writeln!(out, "{name}_bucket{labels} {cumulative}");
                }
                let labels = format_labels(point.attributes(), None);
                let _ = writeln!(out, "{name}_sum{labels} {}", to_f64(point.sum()));
                let _ = writeln!(out, "{name}_count{labels} {}", point.count());
            }
        }
        // not produced by any instrument of the operator
        MetricData::ExponentialHistogram(_) => {}
    }
}

/// Renders every metric as `<scope>_<name>`.
pub fn render(metrics: &ResourceMetrics) -> String {
    let mut out = String::new();
    for scope in metrics.scope_metrics() {
        for metric in scope.metrics() {
            let name = format!("{}_{}", scope.scope().name(), metric.name());
            if !metric.description().is_empty() {
                let _ = writeln!(out, "# HELP {name} {}", metric.description());
            }
            match metric.data() {
                AggregatedMetrics::F64(data) => render_data(&mut out, &name, data, |v| v),
                AggregatedMetrics::U64(data) => render_data(&mut out, &name, data, |v| v as f64),
                AggregatedMetrics::I64(data) => render_data(&mut out, &name, data, |v| v as f64),
            }
        }
    }
    out.push_str("# EOF\n");
    out
}

impl PushMetricExporter for PrometheusExporter {
    async fn export(&self, metrics: &ResourceMetrics) -> Result<(), OTelSdkError> {
        let rendered = render(metrics);
        *self.rendered.write() = Some(rendered);
        Ok(())
    }

    fn force_flush(&self) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        Temporality::Cumulative
    }
}
