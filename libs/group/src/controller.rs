use crate::reconcile::reconcile_group;

use perm8s_k8s_util::error::Result;
use perm8s_operator::controller::{
    ControllerId, ControllerSettings, ObjectQueue, State, check_api_queryable, create_watcher,
    resync, run_workers,
};
use perm8s_operator::crd::Group;

use std::sync::Arc;

use kube::client::Client;
use kube::runtime::reflector::store::Writer;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "group";

/// Watches groups and keeps one ClusterRole per group until `shutdown` fires.
pub async fn run(
    state: State,
    client: Client,
    writer: Writer<Group>,
    settings: ControllerSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    let group_api = check_api_queryable::<Group>(client.clone()).await?;
    let ctx = Arc::new(state.to_context(client, CONTROLLER_ID));
    let queue = ObjectQueue::<Group>::default();

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let watcher = create_watcher(group_api, writer, queue.clone(), ctx.metrics.clone());

    let controller = async {
        if !state.wait_until_ready(&shutdown).await {
            return;
        }
        ctx.metrics.ready_set(1);
        info!(msg = format!("{CONTROLLER_ID} caches synced, starting workers"));

        let reconcile_ctx = ctx.clone();
        tokio::select! {
            _ = resync(
                ctx.stores.group_store.clone(),
                queue.clone(),
                settings.resync_period,
                ctx.metrics.clone(),
            ) => {}
            _ = run_workers(
                queue.clone(),
                settings.workers,
                ctx.metrics.clone(),
                shutdown.clone(),
                move |obj_ref| reconcile_group(obj_ref, reconcile_ctx.clone()),
            ) => {}
        }
    };

    tokio::select! {
        _ = watcher => {}
        _ = controller => {}
    }
    ctx.metrics.ready_set(0);
    info!(msg = format!("{CONTROLLER_ID} controller stopped"));
    Ok(())
}
