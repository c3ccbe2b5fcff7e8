use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An identity allowed into the cluster. Usually created by a SynchronisationSource, in which
/// case the name is the normalized external account name.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "perm8s.io",
    version = "v1alpha1",
    kind = "User",
    plural = "users",
    singular = "user",
    shortname = "pu",
    namespaced,
    doc = r#"The perm8s User custom resource definition (CRD) defines an identity that gets a
    ServiceAccount, a token Secret and one binding per group membership."#,
    printcolumn = r#"{"name":"Authentication Source","type":"string","jsonPath":".spec.authenticationSource"}"#,
    printcolumn = r#"{"name":"Display Name","type":"string","jsonPath":".spec.displayName"}"#,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    #[serde(default)]
    pub display_name: String,

    /// Name of the SynchronisationSource managing this user, empty for hand written users.
    #[serde(default)]
    pub authentication_source: String,

    /// Names of Groups in the user's namespace.
    #[serde(default)]
    pub group_memberships: Vec<String>,
}

impl User {
    pub fn is_managed_by(&self, source: &str) -> bool {
        !source.is_empty() && self.spec.authentication_source == source
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.spec.group_memberships.iter().any(|g| g == group)
    }
}
