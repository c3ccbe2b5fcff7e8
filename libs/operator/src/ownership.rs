//! Explicit ownership of derived objects.
//!
//! Owner references are only valid between namespaced objects in the same namespace, so every
//! derived object also carries labels and an annotation naming its owner. Cleanup of objects that
//! cannot hold an owner reference is driven by finalizers listing them through
//! [`owner_selector`].

use perm8s_k8s_util::error::{Error, Result};

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "perm8s";
pub const OWNER_UID_LABEL: &str = "perm8s.io/owner-uid";
pub const OWNER_ANNOTATION: &str = "perm8s.io/owner";

pub fn owner_uid<K: Resource>(owner: &K) -> Result<String> {
    owner.meta().uid.clone().ok_or_else(|| {
        Error::MissingData(format!(
            "object {} has no uid, ownership cannot be recorded",
            owner.name_any()
        ))
    })
}

/// Label selector matching every object derived from the owner with `uid`.
pub fn owner_selector(uid: &str) -> String {
    format!("{OWNER_UID_LABEL}={uid}")
}

/// `Kind/namespace/name` of the owner, `Kind/name` for cluster scoped owners.
pub fn owner_id<K>(owner: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    match owner.namespace() {
        Some(namespace) => format!("{}/{}/{}", K::kind(&()), namespace, owner.name_any()),
        None => format!("{}/{}", K::kind(&()), owner.name_any()),
    }
}

/// Metadata of an object named `name` derived from `owner`. `namespace` is `None` for cluster
/// scoped objects.
pub fn owned_metadata<K>(owner: &K, name: &str, namespace: Option<&str>) -> Result<ObjectMeta>
where
    K: Resource<DynamicType = ()>,
{
    let uid = owner_uid(owner)?;
    let same_namespace = namespace.is_some() && namespace == owner.meta().namespace.as_deref();
    let owner_references = same_namespace
        .then(|| owner.controller_owner_ref(&()))
        .flatten()
        .map(|owner_ref| vec![owner_ref]);

    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (OWNER_UID_LABEL.to_string(), uid),
        ])),
        annotations: Some(BTreeMap::from([(
            OWNER_ANNOTATION.to_string(),
            owner_id(owner),
        )])),
        owner_references,
        ..ObjectMeta::default()
    })
}

pub fn is_owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(OWNER_UID_LABEL))
        .is_some_and(|owner| owner == uid)
}

fn contains_all(
    current: &Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) -> bool {
    desired
        .iter()
        .flatten()
        .all(|(k, v)| current.as_ref().and_then(|c| c.get(k)) == Some(v))
}

/// Whether `meta` already carries every ownership label, annotation and owner reference of
/// `desired`.
pub fn has_ownership(meta: &ObjectMeta, desired: &ObjectMeta) -> bool {
    contains_all(&meta.labels, &desired.labels)
        && contains_all(&meta.annotations, &desired.annotations)
        && desired
            .owner_references
            .iter()
            .flatten()
            .all(|r| meta.owner_references.iter().flatten().any(|c| c.uid == r.uid))
}

/// Stamps the ownership labels, annotation and owner references of `desired` onto `meta`. Other
/// labels and annotations are kept. A controller reference to another owner is replaced, an
/// object has at most one controller.
pub fn adopt(mut meta: ObjectMeta, desired: &ObjectMeta) -> ObjectMeta {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(desired.labels.clone().unwrap_or_default());
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(desired.annotations.clone().unwrap_or_default());
    for owner_ref in desired.owner_references.iter().flatten() {
        let refs = meta.owner_references.get_or_insert_with(Vec::new);
        if owner_ref.controller == Some(true) {
            refs.retain(|r| r.controller != Some(true) || r.uid == owner_ref.uid);
        }
        if !refs.iter().any(|r| r.uid == owner_ref.uid) {
            refs.push(owner_ref.clone());
        }
    }
    meta
}
