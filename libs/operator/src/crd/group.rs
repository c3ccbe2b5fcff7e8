use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named set of permissions. Every Group is projected into one ClusterRole named after it;
/// members are bound to that role either cluster wide or in each of the listed namespaces.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "perm8s.io",
    version = "v1alpha1",
    kind = "Group",
    plural = "groups",
    singular = "group",
    shortname = "pg",
    namespaced,
    doc = r#"The perm8s Group custom resource definition (CRD) defines a set of permissions
    granted to every User that lists it as a membership."#,
    printcolumn = r#"{"name":"Display Name","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Description","type":"string","jsonPath":".spec.description"}"#,
    printcolumn = r#"{"name":"Cluster","type":"boolean","jsonPath":".spec.clusterGroup"}"#,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Rules of the ClusterRole generated for this group. Order is kept.
    #[serde(default)]
    pub permissions: Vec<PolicyRule>,

    /// Namespaces where members get a RoleBinding. Ignored when `clusterGroup` is set.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Bind members with a ClusterRoleBinding instead of per namespace RoleBindings.
    #[serde(default)]
    pub cluster_group: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_missing_optional_fields() {
        let group: Group = serde_json::from_value(serde_json::json!({
            "apiVersion": "perm8s.io/v1alpha1",
            "kind": "Group",
            "metadata": {"name": "developers", "namespace": "default"},
            "spec": {"displayName": "Developers", "clusterGroup": true}
        }))
        .unwrap();
        assert!(group.spec.cluster_group);
        assert!(group.spec.permissions.is_empty());
        assert!(group.spec.namespaces.is_empty());
    }
}
