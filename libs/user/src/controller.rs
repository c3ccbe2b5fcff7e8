use crate::reconcile::reconcile_user;

use perm8s_k8s_util::error::Result;
use perm8s_operator::controller::{
    ControllerId, ControllerSettings, ObjectQueue, State, check_api_queryable, create_watcher,
    resync, run_workers,
};
use perm8s_operator::crd::{Group, User};
use perm8s_operator::metrics::{self, ControllerMetrics};

use std::sync::Arc;

use futures::StreamExt;
use kube::ResourceExt;
use kube::client::Client;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, ReflectHandle, Store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const CONTROLLER_ID: ControllerId = "user";

/// Enqueues the cached users of `group`'s namespace that list it in their memberships.
pub fn enqueue_members(
    group: &Group,
    user_store: &Store<User>,
    queue: &ObjectQueue<User>,
    metrics: &ControllerMetrics,
) {
    let group_name = group.name_any();
    let namespace = group.namespace();
    let members = user_store
        .state()
        .into_iter()
        .filter(|user| user.namespace() == namespace && user.is_member_of(&group_name));
    for user in members {
        debug!(
            msg = "group changed, trigger user reconcile",
            group = group_name,
            user = user.name_any()
        );
        queue.add(ObjectRef::from(user.as_ref()));
        metrics.triggered_inc(metrics::Action::Apply, "Group");
    }
    metrics.queue_depth_set(queue.len());
}

/// Watches users and keeps their service accounts and bindings until `shutdown` fires.
/// `groups` streams every group change seen by the group watcher.
pub async fn run(
    state: State,
    client: Client,
    writer: Writer<User>,
    groups: ReflectHandle<Group>,
    settings: ControllerSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    let user_api = check_api_queryable::<User>(client.clone()).await?;
    let ctx = Arc::new(state.to_context(client, CONTROLLER_ID));
    let queue = ObjectQueue::<User>::default();

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let watcher = create_watcher(user_api, writer, queue.clone(), ctx.metrics.clone());
    // the shared group writer blocks once its buffer is full, so changes are consumed from the
    // start, before the caches are ready
    let group_changes = groups.for_each(|group| {
        enqueue_members(&group, &ctx.stores.user_store, &queue, &ctx.metrics);
        futures::future::ready(())
    });

    let controller = async {
        if !state.wait_until_ready(&shutdown).await {
            return;
        }
        ctx.metrics.ready_set(1);
        info!(msg = format!("{CONTROLLER_ID} caches synced, starting workers"));

        let reconcile_ctx = ctx.clone();
        tokio::select! {
            _ = resync(
                ctx.stores.user_store.clone(),
                queue.clone(),
                settings.resync_period,
                ctx.metrics.clone(),
            ) => {}
            _ = run_workers(
                queue.clone(),
                settings.workers,
                ctx.metrics.clone(),
                shutdown.clone(),
                move |obj_ref| reconcile_user(obj_ref, reconcile_ctx.clone()),
            ) => {}
        }
    };

    tokio::select! {
        _ = watcher => {}
        _ = group_changes => {}
        _ = controller => {}
    }
    ctx.metrics.ready_set(0);
    info!(msg = format!("{CONTROLLER_ID} controller stopped"));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use perm8s_operator::test_util::TestStores;

    use opentelemetry::global;

    #[test]
    fn group_change_enqueues_its_members_only() {
        let mut stores = TestStores::default();
        stores.apply_user(&User::test("jane", &["admins"]));
        stores.apply_user(&User::test("john", &["developers"]));
        let mut elsewhere = User::test("joe", &["admins"]);
        elsewhere.metadata.namespace = Some("other".to_string());
        stores.apply_user(&elsewhere);

        let queue = ObjectQueue::<User>::default();
        let metrics = ControllerMetrics::new(CONTROLLER_ID, &global::meter("test"));
        enqueue_members(
            &Group::test("admins"),
            &stores.stores().user_store,
            &queue,
            &metrics,
        );

        assert_eq!(queue.len(), 1);
    }
}
