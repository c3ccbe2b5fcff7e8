use crate::prometheus_exporter::PrometheusExporter;

use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::Meter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use thiserror::Error;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

pub const METER_NAME: &str = "perm8s";
pub const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[source] ParseError),

    #[error("failed to install tracing subscriber: {0}")]
    SubscriberInit(#[source] TryInitError),
}

/// Installs the global tracing subscriber.
pub fn init(log_filter: &str, log_format: LogFormat) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(log_filter).map_err(TelemetryError::InvalidFilter)?;
    let registry = tracing_subscriber::registry().with(filter);
    match log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
    }
    .map_err(TelemetryError::SubscriberInit)
}

/// Sets up the global meter provider. The returned exporter holds the rendered metrics for the
/// `/metrics` endpoint; the provider has to be kept alive for the process lifetime.
pub fn init_metrics(interval: Duration) -> (SdkMeterProvider, PrometheusExporter, Meter) {
    let exporter = PrometheusExporter::new();
    let reader = PeriodicReader::builder(exporter.clone())
        .with_interval(interval)
        .build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider.clone());
    (provider, exporter, global::meter(METER_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        assert!(matches!(
            init("info,perm8s=loud", LogFormat::Text),
            Err(TelemetryError::InvalidFilter(_))
        ));
    }
}
