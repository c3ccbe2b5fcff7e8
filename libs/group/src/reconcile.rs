use perm8s_k8s_util::error::{Error, Result, is_kube_not_found};
use perm8s_operator::controller::context::{
    Context, REASON_CREATED, REASON_DELETED, REASON_FAILED, REASON_SYNCED,
};
use perm8s_operator::crd::Group;
use perm8s_operator::ownership::{adopt, has_ownership, is_owned_by, owned_metadata, owner_uid};

use std::sync::Arc;

use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use kube::ResourceExt;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as Finalizer, finalizer};
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, info, instrument, trace};

pub static GROUP_FINALIZER: &str = "perm8s.io/group";

#[instrument(skip(ctx), fields(namespace = obj_ref.namespace.as_deref(), name = %obj_ref.name))]
pub async fn reconcile_group(obj_ref: ObjectRef<Group>, ctx: Arc<Context>) -> Result<()> {
    let Some(group) = ctx.stores.group_store.get(&obj_ref) else {
        debug!(msg = "group no longer exists");
        return Ok(());
    };
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling group");

    let namespace = group.namespace().unwrap_or_default();
    let groups_api: Api<Group> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&groups_api, GROUP_FINALIZER, group, |event| async {
        match event {
            Finalizer::Apply(g) => g.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(g) => g.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map(|_| ())
    .map_err(|e| Error::FinalizerError("failed on group finalizer".to_string(), Box::new(e)))
}

/// Empty optional lists are dropped by the API server, treat them as absent.
fn normalize_rule(rule: &PolicyRule) -> PolicyRule {
    let non_empty = |list: &Option<Vec<String>>| list.clone().filter(|l| !l.is_empty());
    PolicyRule {
        api_groups: non_empty(&rule.api_groups),
        non_resource_urls: non_empty(&rule.non_resource_urls),
        resource_names: non_empty(&rule.resource_names),
        resources: non_empty(&rule.resources),
        verbs: rule.verbs.clone(),
    }
}

/// Ordered, element-wise comparison of the rules. A missing rule list equals an empty one.
pub fn rules_match(current: &ClusterRole, desired: &ClusterRole) -> bool {
    let current = current.rules.as_deref().unwrap_or_default();
    let desired = desired.rules.as_deref().unwrap_or_default();
    current.len() == desired.len()
        && current
            .iter()
            .zip(desired)
            .all(|(c, d)| normalize_rule(c) == normalize_rule(d))
}

trait GroupExt {
    fn desired_cluster_role(&self) -> Result<ClusterRole>;
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action>;
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action>;
}

impl GroupExt for Group {
    fn desired_cluster_role(&self) -> Result<ClusterRole> {
        Ok(ClusterRole {
            metadata: owned_metadata(self, &self.name_any(), None)?,
            rules: Some(self.spec.permissions.clone()),
            ..ClusterRole::default()
        })
    }

    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let desired = self.desired_cluster_role()?;
        let cluster_role_api: Api<ClusterRole> = Api::all(ctx.client.clone());

        let current = cluster_role_api.get_opt(&name).await.map_err(|e| {
            Error::KubeError(format!("failed to get cluster role {name}"), Box::new(e))
        })?;
        match current {
            None => {
                cluster_role_api
                    .create(&PostParams::default(), &desired)
                    .await
                    .map_err(|e| {
                        Error::KubeError(
                            format!("failed to create cluster role {name}"),
                            Box::new(e),
                        )
                    })?;
                info!(msg = "cluster role created", cluster_role = name);
                ctx.publish_normal(
                    self,
                    REASON_CREATED,
                    "Creating",
                    format!("ClusterRole {name} created successfully"),
                )
                .await;
            }
            Some(current)
                if !rules_match(&current, &desired)
                    || !has_ownership(&current.metadata, &desired.metadata) =>
            {
                info!(msg = "cluster role is out of sync, resyncing", cluster_role = name);
                let updated = ClusterRole {
                    metadata: adopt(current.metadata, &desired.metadata),
                    rules: desired.rules,
                    ..current
                };
                cluster_role_api
                    .replace(&name, &PostParams::default(), &updated)
                    .await
                    .map_err(|e| {
                        Error::KubeError(
                            format!("failed to update cluster role {name}"),
                            Box::new(e),
                        )
                    })?;
                ctx.publish_normal(
                    self,
                    REASON_SYNCED,
                    "Updating",
                    format!("ClusterRole {name} synchronised successfully"),
                )
                .await;
            }
            Some(_) => trace!(msg = "cluster role up to date", cluster_role = name),
        }

        ctx.publish_normal(
            self,
            REASON_SYNCED,
            "Reconciling",
            "Group synced successfully".to_string(),
        )
        .await;
        Ok(Action::await_change())
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let uid = owner_uid(self)?;
        let cluster_role_api: Api<ClusterRole> = Api::all(ctx.client.clone());

        let current = cluster_role_api.get_opt(&name).await.map_err(|e| {
            Error::KubeError(format!("failed to get cluster role {name}"), Box::new(e))
        })?;
        if !current.is_some_and(|c| is_owned_by(&c.metadata, &uid)) {
            debug!(msg = "no cluster role owned by the group left", cluster_role = name);
            return Ok(Action::await_change());
        }

        match cluster_role_api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(msg = "cluster role deleted", cluster_role = name);
                ctx.publish_normal(
                    self,
                    REASON_DELETED,
                    "Deleting",
                    format!("ClusterRole {name} deleted"),
                )
                .await;
            }
            Err(e) if is_kube_not_found(&e) => {}
            Err(e) => {
                ctx.publish_warning(
                    self,
                    REASON_FAILED,
                    "Deleting",
                    format!("failed to delete ClusterRole {name}: {e}"),
                )
                .await;
                return Err(Error::KubeError(
                    format!("failed to delete cluster role {name}"),
                    Box::new(e),
                ));
            }
        }
        Ok(Action::await_change())
    }
}
