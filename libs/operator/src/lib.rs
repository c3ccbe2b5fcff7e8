pub mod controller;
pub mod crd;
pub mod metrics;
pub mod ownership;
pub mod prometheus_exporter;
pub mod telemetry;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
