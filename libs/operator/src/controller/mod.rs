pub mod context;

use self::context::Context;

use crate::crd::{Group, SynchronisationSource, User};
use crate::metrics::{self, ControllerMetrics};
use crate::prometheus_exporter::PrometheusExporter;

use perm8s_k8s_util::error::{Error, Result};
use perm8s_k8s_util::queue::WorkQueue;
use perm8s_k8s_util::types::short_type_name;

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use kube::Resource;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::store::{Writer, WriterDropped};
use kube::runtime::reflector::{self, ObjectRef, ReflectHandle, Store};
use kube::runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);
pub const SUBSCRIBE_BUFFER_SIZE: usize = 256;

pub type ControllerId = &'static str;

#[derive(Clone, Copy, Debug)]
pub struct ControllerSettings {
    /// Tasks reconciling items of one queue in parallel
    pub workers: usize,
    /// Period of the full re-enqueue of every cached object
    pub resync_period: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_period: DEFAULT_RESYNC_PERIOD,
        }
    }
}

/// Queue of references to objects of kind `K` waiting to be reconciled.
pub type ObjectQueue<K> = WorkQueue<ObjectRef<K>>;

/// Caches of the perm8s resources, shared by every controller.
#[derive(Clone)]
pub struct Stores {
    pub group_store: Store<Group>,
    pub user_store: Store<User>,
    pub source_store: Store<SynchronisationSource>,
}

impl Stores {
    pub fn new(
        group_store: Store<Group>,
        user_store: Store<User>,
        source_store: Store<SynchronisationSource>,
    ) -> Self {
        Self {
            group_store,
            user_store,
            source_store,
        }
    }

    /// Resolves once every cache received its initial list.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        self.group_store.wait_until_ready().await?;
        self.user_store.wait_until_ready().await?;
        self.source_store.wait_until_ready().await
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Metrics
    metrics: Arc<metrics::Metrics>,
    /// Rendered metrics of the last export
    exporter: PrometheusExporter,
    /// Caches of the perm8s resources
    pub stores: Stores,
    /// Set once every cache finished its initial list
    ready: Arc<AtomicBool>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(metrics: metrics::Metrics, exporter: PrometheusExporter, stores: Stores) -> Self {
        Self {
            metrics: Arc::new(metrics),
            exporter,
            stores,
            ready: Arc::default(),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String> {
        self.exporter
            .get_metrics()
            .ok_or_else(|| Error::MissingData("no metrics exported yet".to_string()))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Startup barrier: resolves when every cache is synced, or returns `false` when `shutdown`
    /// fires first.
    pub async fn wait_until_ready(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            result = self.stores.wait_until_ready() => match result {
                Ok(()) => {
                    self.ready.store(true, Ordering::Relaxed);
                    true
                }
                Err(e) => {
                    error!(msg = "cache writer dropped before initial sync", %e);
                    false
                }
            },
            _ = shutdown.cancelled() => false,
        }
    }

    /// Create a Controller Context that can update State
    pub fn to_context(&self, client: Client, controller_id: ControllerId) -> Context {
        Context::new(
            controller_id,
            client.clone(),
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all CONTROLLER_IDs have to be registered")
                .clone(),
            Recorder::new(client, controller_id.into()),
            self.stores.clone(),
        )
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Result<Api<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client);
    api.list(&ListParams::default().limit(1)).await.map_err(|e| {
        Error::KubeError(
            format!(
                "{} is not queryable, check controller permissions",
                short_type_name::<K>().unwrap_or("Unknown resource")
            ),
            Box::new(e),
        )
    })?;
    Ok(api)
}

/// Shared store whose changes can also be consumed by other controllers.
pub struct ResourceReflector<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub store: Store<K>,
    pub writer: Writer<K>,
    pub subscriber: ReflectHandle<K>,
}

pub fn create_subscriber<K>(buffer_size: usize) -> ResourceReflector<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let (store, writer) = reflector::store_shared::<K>(buffer_size);
    let subscriber = writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    ResourceReflector {
        store,
        writer,
        subscriber,
    }
}

/// Keeps `writer` in sync with the API server and enqueues every applied or deleted object.
pub fn create_watcher<K>(
    api: Api<K>,
    writer: Writer<K>,
    queue: ObjectQueue<K>,
    metrics: Arc<ControllerMetrics>,
) -> BoxFuture<'static, ()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let resource_name = short_type_name::<K>().unwrap_or("Unknown");

    watcher(api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect_shared(writer)
        .for_each(move |res| {
            let queue = queue.clone();
            let metrics = metrics.clone();
            async move {
                match res {
                    Ok(event) => {
                        trace!(msg = "watched event", ?event);
                        match event {
                            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                                debug!(
                                    msg = "apply event triggers reconcile",
                                    resource = resource_name,
                                    namespace = obj.namespace(),
                                    name = obj.name_any()
                                );
                                queue.add(ObjectRef::from(&obj));
                                metrics.triggered_inc(metrics::Action::Apply, resource_name);
                            }
                            watcher::Event::Delete(obj) => {
                                debug!(
                                    msg = "delete event triggers reconcile",
                                    resource = resource_name,
                                    namespace = obj.namespace(),
                                    name = obj.name_any()
                                );
                                queue.add(ObjectRef::from(&obj));
                                metrics.triggered_inc(metrics::Action::Delete, resource_name);
                            }
                            watcher::Event::Init | watcher::Event::InitDone => {}
                        }
                        metrics.queue_depth_set(queue.len());
                    }
                    Err(e) => {
                        error!(msg = format!("unexpected error when watching {resource_name}"), %e);
                        metrics.watch_operations_failed_inc();
                    }
                }
            }
        })
        .boxed()
}

/// Re-enqueues every cached object each `period`, forever.
pub async fn resync<K>(
    store: Store<K>,
    queue: ObjectQueue<K>,
    period: Duration,
    metrics: Arc<ControllerMetrics>,
) where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let resource_name = short_type_name::<K>().unwrap_or("Unknown");
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let objects = store.state();
        trace!(msg = format!("resync {} {resource_name}", objects.len()));
        for obj in objects {
            queue.add(ObjectRef::from(obj.as_ref()));
            metrics.triggered_inc(metrics::Action::Resync, resource_name);
        }
        metrics.queue_depth_set(queue.len());
    }
}

/// Handles one queue item. Returns `false` once the queue is shut down.
pub async fn process_next_item<K, F, Fut>(
    queue: &ObjectQueue<K>,
    metrics: &ControllerMetrics,
    reconcile: &F,
) -> bool
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
    F: Fn(ObjectRef<K>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let Some(obj_ref) = queue.get().await else {
        return false;
    };
    let _done = queue.done_guard(obj_ref.clone());
    metrics.queue_depth_set(queue.len());

    match reconcile(obj_ref.clone()).await {
        Ok(()) => queue.forget(&obj_ref),
        Err(error) => {
            error!(
                msg = "failed reconciliation",
                namespace = obj_ref.namespace.as_deref(),
                name = obj_ref.name,
                %error
            );
            metrics.reconcile_failure_inc();
            queue.add_rate_limited(obj_ref);
        }
    }
    true
}

/// Runs `workers` tasks reconciling items of `queue` until `shutdown` fires. In-flight
/// reconciles are awaited before returning.
pub async fn run_workers<K, F, Fut>(
    queue: ObjectQueue<K>,
    workers: usize,
    metrics: Arc<ControllerMetrics>,
    shutdown: CancellationToken,
    reconcile: F,
) where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
    F: Fn(ObjectRef<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let reconcile = Arc::new(reconcile);
    let mut tasks = JoinSet::new();
    for _ in 0..workers.max(1) {
        let queue = queue.clone();
        let metrics = metrics.clone();
        let reconcile = reconcile.clone();
        tasks.spawn(async move {
            while process_next_item(&queue, &metrics, reconcile.as_ref()).await {}
        });
    }

    shutdown.cancelled().await;
    info!(msg = format!("stopping {} workers", workers.max(1)));
    queue.shut_down();
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(msg = "worker task failed", %e);
        }
    }
}
