use perm8s_k8s_util::error::{Error, Result, is_kube_not_found};
use perm8s_operator::crd::{Group, User};
use perm8s_operator::ownership::{adopt, has_ownership, owned_metadata, owner_selector};

use std::collections::BTreeSet;
use std::fmt::Debug;

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

#[inline]
pub fn binding_name(user: &str, group: &str) -> String {
    format!("{user}-membership-{group}")
}

/// Every membership binding grants the ClusterRole named after the group.
pub fn role_ref_for(group: &Group) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: group.name_any(),
    }
}

/// Common shape of ClusterRoleBindings and RoleBindings.
pub trait Binding:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    fn subjects(&self) -> &[Subject];
    fn role_ref(&self) -> &RoleRef;
    fn with_subjects(self, subjects: Vec<Subject>) -> Self;
    /// Api scoped to where the binding lives.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

impl Binding for ClusterRoleBinding {
    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }

    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn with_subjects(self, subjects: Vec<Subject>) -> Self {
        Self {
            subjects: Some(subjects),
            ..self
        }
    }

    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }
}

impl Binding for RoleBinding {
    fn subjects(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }

    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn with_subjects(self, subjects: Vec<Subject>) -> Self {
        Self {
            subjects: Some(subjects),
            ..self
        }
    }

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        }
    }
}

fn normalize_subject(subject: &Subject) -> Subject {
    Subject {
        api_group: subject.api_group.clone().filter(|g| !g.is_empty()),
        ..subject.clone()
    }
}

/// Ordered, structural comparison of the subjects.
pub fn subjects_match(current: &[Subject], desired: &[Subject]) -> bool {
    current.len() == desired.len()
        && current
            .iter()
            .zip(desired)
            .all(|(c, d)| normalize_subject(c) == normalize_subject(d))
}

/// `(namespace, name)` of a binding.
pub type BindingKey = (Option<String>, String);

pub fn binding_key<K: Binding>(binding: &K) -> BindingKey {
    (binding.namespace(), binding.name_any())
}

/// Bindings a user should hold, grouped by kind.
#[derive(Debug, Default)]
pub struct DesiredBindings {
    pub cluster: Vec<ClusterRoleBinding>,
    pub namespaced: Vec<RoleBinding>,
}

impl DesiredBindings {
    pub fn cluster_keys(&self) -> BTreeSet<BindingKey> {
        self.cluster.iter().map(binding_key).collect()
    }

    pub fn namespaced_keys(&self) -> BTreeSet<BindingKey> {
        self.namespaced.iter().map(binding_key).collect()
    }
}

pub trait BindingExt {
    fn subject(&self) -> Subject;
    fn desired_cluster_role_binding(&self, group: &Group) -> Result<ClusterRoleBinding>;
    fn desired_role_binding(&self, group: &Group, namespace: &str) -> Result<RoleBinding>;
    fn desired_bindings<'a>(&self, groups: impl IntoIterator<Item = &'a Group>)
    -> Result<DesiredBindings>;
}

impl BindingExt for User {
    fn subject(&self) -> Subject {
        Subject {
            kind: "ServiceAccount".to_string(),
            name: self.name_any(),
            namespace: self.namespace(),
            ..Subject::default()
        }
    }

    fn desired_cluster_role_binding(&self, group: &Group) -> Result<ClusterRoleBinding> {
        Ok(ClusterRoleBinding {
            metadata: owned_metadata(
                self,
                &binding_name(&self.name_any(), &group.name_any()),
                None,
            )?,
            role_ref: role_ref_for(group),
            subjects: Some(vec![self.subject()]),
        })
    }

    fn desired_role_binding(&self, group: &Group, namespace: &str) -> Result<RoleBinding> {
        Ok(RoleBinding {
            metadata: owned_metadata(
                self,
                &binding_name(&self.name_any(), &group.name_any()),
                Some(namespace),
            )?,
            role_ref: role_ref_for(group),
            subjects: Some(vec![self.subject()]),
        })
    }

    fn desired_bindings<'a>(
        &self,
        groups: impl IntoIterator<Item = &'a Group>,
    ) -> Result<DesiredBindings> {
        let mut desired = DesiredBindings::default();
        for group in groups {
            if group.spec.cluster_group {
                desired
                    .cluster
                    .push(self.desired_cluster_role_binding(group)?);
            } else {
                for namespace in &group.spec.namespaces {
                    desired
                        .namespaced
                        .push(self.desired_role_binding(group, namespace)?);
                }
            }
        }
        Ok(desired)
    }
}

/// Creates `desired` or brings an existing binding back to its subjects, role and ownership. The
/// role reference of a binding is immutable, so a binding pointing at another role is recreated.
/// Bindings missing the ownership labels are adopted so that sweeps can find them.
pub async fn ensure_binding<K: Binding>(client: Client, desired: &K) -> Result<()> {
    let name = desired.name_any();
    let kind = K::kind(&());
    let api = K::api(client, desired.namespace().as_deref());

    let current = api
        .get_opt(&name)
        .await
        .map_err(|e| Error::KubeError(format!("failed to get {kind} {name}"), Box::new(e)))?;
    match current {
        Some(current) if current.role_ref() != desired.role_ref() => {
            info!(msg = format!("{kind} points to another role, recreating"), name);
            delete_binding(&api, &name).await?;
            create_binding(&api, desired).await
        }
        Some(current)
            if !subjects_match(current.subjects(), desired.subjects())
                || !has_ownership(current.meta(), desired.meta()) =>
        {
            info!(msg = format!("{kind} drifted, updating"), name);
            let mut updated = current.with_subjects(desired.subjects().to_vec());
            let metadata = std::mem::take(updated.meta_mut());
            *updated.meta_mut() = adopt(metadata, desired.meta());
            api.replace(&name, &PostParams::default(), &updated)
                .await
                .map_err(|e| {
                    Error::KubeError(format!("failed to update {kind} {name}"), Box::new(e))
                })?;
            Ok(())
        }
        Some(_) => {
            debug!(msg = format!("{kind} up to date"), name);
            Ok(())
        }
        None => create_binding(&api, desired).await,
    }
}

async fn create_binding<K: Binding>(api: &Api<K>, desired: &K) -> Result<()> {
    let name = desired.name_any();
    api.create(&PostParams::default(), desired)
        .await
        .map_err(|e| {
            Error::KubeError(
                format!("failed to create {} {name}", K::kind(&())),
                Box::new(e),
            )
        })?;
    info!(msg = format!("{} created", K::kind(&())), name);
    Ok(())
}

async fn delete_binding<K: Binding>(api: &Api<K>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(msg = format!("{} deleted", K::kind(&())), name);
            Ok(())
        }
        Err(e) if is_kube_not_found(&e) => Ok(()),
        Err(e) => Err(Error::KubeError(
            format!("failed to delete {} {name}", K::kind(&())),
            Box::new(e),
        )),
    }
}

/// Deletes every binding of kind `K` created for the owner with `owner_uid` that is not in
/// `keep`. Returns the number of deleted bindings.
pub async fn sweep_bindings<K: Binding>(
    client: Client,
    owner_uid: &str,
    keep: &BTreeSet<BindingKey>,
) -> Result<usize> {
    let kind = K::kind(&());
    let owned = Api::<K>::all(client.clone())
        .list(&ListParams::default().labels(&owner_selector(owner_uid)))
        .await
        .map_err(|e| Error::KubeError(format!("failed to list owned {kind}"), Box::new(e)))?;

    let mut deleted = 0;
    for binding in owned.items.iter().filter(|b| !keep.contains(&binding_key(*b))) {
        let api = K::api(client.clone(), binding.namespace().as_deref());
        delete_binding(&api, &binding.name_any()).await?;
        deleted += 1;
    }
    Ok(deleted)
}
