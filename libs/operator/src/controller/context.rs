use super::{ControllerId, Stores};

use crate::metrics::ControllerMetrics;

use std::sync::Arc;

use kube::Resource;
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

pub const REASON_CREATED: &str = "Created";
pub const REASON_SYNCED: &str = "Synced";
pub const REASON_DELETED: &str = "Deleted";
pub const REASON_FAILED: &str = "Failed";

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Controller ID
    pub controller_id: ControllerId,
    /// Kubernetes client
    pub client: Client,
    /// Prometheus metrics
    pub metrics: Arc<ControllerMetrics>,
    /// Event recorder
    pub recorder: Recorder,
    /// Caches of the perm8s resources
    pub stores: Stores,
}

impl Context {
    pub fn new(
        controller_id: ControllerId,
        client: Client,
        metrics: Arc<ControllerMetrics>,
        recorder: Recorder,
        stores: Stores,
    ) -> Self {
        Self {
            controller_id,
            client,
            metrics,
            recorder,
            stores,
        }
    }

    /// Publishes an event attached to `obj`. Failing to publish is logged and otherwise ignored.
    pub async fn publish_event<K>(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &obj.object_ref(&())).await {
            warn!(msg = "failed to publish event", reason, %e);
        }
    }

    pub async fn publish_normal<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish_event(obj, EventType::Normal, reason, action, note)
            .await
    }

    pub async fn publish_warning<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish_event(obj, EventType::Warning, reason, action, note)
            .await
    }
}
