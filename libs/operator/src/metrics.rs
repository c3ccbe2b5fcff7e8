use crate::controller::ControllerId;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
}

impl Metrics {
    pub fn new(meter: &Meter, controller_names: &[ControllerId]) -> Self {
        let controllers = controller_names
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::new(id, meter))))
            .collect::<HashMap<ControllerId, Arc<ControllerMetrics>>>();

        Self { controllers }
    }
}

/// Metrics of one controller. Every series carries a `controller` attribute.
#[derive(Clone)]
pub struct ControllerMetrics {
    attributes: [KeyValue; 1],
    reconcile_operations: Counter<u64>,
    reconcile_failures: Counter<u64>,
    reconcile_duration: Histogram<f64>,
    triggered: Counter<u64>,
    watch_operations_failed: Counter<u64>,
    ready: Gauge<i64>,
    queue_depth: Gauge<i64>,
}

impl ControllerMetrics {
    pub fn new(controller: &str, meter: &Meter) -> Self {
        Self {
            attributes: [KeyValue::new("controller", controller.to_string())],
            reconcile_operations: meter
                .u64_counter("reconcile_operations")
                .with_description("Reconcile passes started")
                .build(),
            reconcile_failures: meter
                .u64_counter("reconcile_failures")
                .with_description("Reconcile passes that returned an error and were requeued")
                .build(),
            reconcile_duration: meter
                .f64_histogram("reconcile_duration_seconds")
                .with_description("Duration of reconcile passes")
                .with_unit("s")
                .build(),
            triggered: meter
                .u64_counter("triggered")
                .with_description("Objects enqueued by a watch event, a group change or a resync")
                .build(),
            watch_operations_failed: meter
                .u64_counter("watch_operations_failed")
                .with_description("Watch stream errors")
                .build(),
            ready: meter
                .i64_gauge("ready")
                .with_description("1 once the caches are synced and workers run, 0 otherwise")
                .build(),
            queue_depth: meter
                .i64_gauge("queue_depth")
                .with_description("Objects waiting in the work queue")
                .build(),
        }
    }

    pub fn reconcile_failure_inc(&self) {
        self.reconcile_failures.add(1, &self.attributes);
    }

    /// Counts a reconcile pass. Its duration is recorded when the returned guard is dropped.
    pub fn reconcile_count_and_measure(&self) -> ReconcileMeasurer {
        self.reconcile_operations.add(1, &self.attributes);
        ReconcileMeasurer {
            start: Instant::now(),
            attributes: self.attributes.clone(),
            histogram: self.reconcile_duration.clone(),
        }
    }

    pub fn triggered_inc(&self, action: Action, triggered_by: &str) {
        let [controller] = self.attributes.clone();
        self.triggered.add(
            1,
            &[
                controller,
                KeyValue::new("action", action.as_str()),
                KeyValue::new("triggered_by", triggered_by.to_string()),
            ],
        );
    }

    pub fn watch_operations_failed_inc(&self) {
        self.watch_operations_failed.add(1, &self.attributes);
    }

    pub fn ready_set(&self, status: i64) {
        self.ready.record(status, &self.attributes);
    }

    pub fn queue_depth_set(&self, depth: usize) {
        self.queue_depth
            .record(i64::try_from(depth).unwrap_or(i64::MAX), &self.attributes);
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    attributes: [KeyValue; 1],
    histogram: Histogram<f64>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        self.histogram
            .record(self.start.elapsed().as_secs_f64(), &self.attributes);
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Action {
    Apply,
    Delete,
    Resync,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Apply => "apply",
            Action::Delete => "delete",
            Action::Resync => "resync",
        }
    }
}
