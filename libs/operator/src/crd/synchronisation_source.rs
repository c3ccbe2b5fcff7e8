use std::collections::BTreeMap;

use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const AUTHENTIK_TYPE: &str = "authentik";

/// An external identity provider whose users are projected into perm8s Users.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "perm8s.io",
    version = "v1alpha1",
    kind = "SynchronisationSource",
    plural = "synchronisationsources",
    singular = "synchronisationsource",
    shortname = "psync",
    namespaced,
    doc = r#"The perm8s SynchronisationSource custom resource definition (CRD) defines an
    identity provider. Users of the provider become perm8s Users in the same namespace."#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct SynchronisationSourceSpec {
    /// Provider kind. Selects which configuration block is used.
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentik: Option<AuthentikSource>,

    /// External group id to perm8s Group name. Unmapped groups are ignored.
    #[serde(default)]
    pub group_mappings: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct AuthentikSource {
    /// Host, and optional port, of the Authentik instance.
    pub url: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Secret in the source namespace holding the API token under the `token` key.
    pub secret_name: String,

    /// Only users in at least one of these groups are synchronised. Empty admits every user.
    #[serde(default)]
    pub required_groups: Vec<String>,
}

fn default_scheme() -> String {
    "https".to_string()
}

/// Provider resolved from the `type` tag and its configuration block.
#[derive(Clone, Debug, PartialEq)]
pub enum Provider {
    Authentik(AuthentikSource),
}

impl Provider {
    pub fn type_name(&self) -> &'static str {
        match self {
            Provider::Authentik(_) => AUTHENTIK_TYPE,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("unknown synchronisation source type '{0}'")]
    UnknownType(String),

    #[error("synchronisation source type '{0}' has no '{0}' configuration")]
    MissingConfig(&'static str),
}

impl SynchronisationSourceSpec {
    pub fn provider(&self) -> Result<Provider, ProviderError> {
        match self.type_.as_str() {
            AUTHENTIK_TYPE => self
                .authentik
                .clone()
                .map(Provider::Authentik)
                .ok_or(ProviderError::MissingConfig(AUTHENTIK_TYPE)),
            other => Err(ProviderError::UnknownType(other.to_string())),
        }
    }

    /// Maps external groups to Group names, dropping unmapped ones. Order of `groups` is kept.
    pub fn map_groups<'a>(&self, groups: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        groups
            .into_iter()
            .filter_map(|g| self.group_mappings.get(g).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(value: serde_json::Value) -> SynchronisationSourceSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_authentik_provider() {
        let spec = spec(serde_json::json!({
            "type": "authentik",
            "authentik": {"url": "auth.example.com", "secretName": "authentik-token"},
            "groupMappings": {"g1": "developers"}
        }));
        let Provider::Authentik(config) = spec.provider().unwrap();
        assert_eq!(config.scheme, "https");
        assert_eq!(config.secret_name, "authentik-token");
        assert!(config.required_groups.is_empty());
    }

    #[test]
    fn test_unknown_type_still_deserializes() {
        let spec = spec(serde_json::json!({"type": "ldap"}));
        assert_eq!(
            spec.provider(),
            Err(ProviderError::UnknownType("ldap".to_string()))
        );
    }

    #[test]
    fn test_missing_provider_config() {
        let spec = spec(serde_json::json!({"type": "authentik"}));
        assert_eq!(
            spec.provider(),
            Err(ProviderError::MissingConfig(AUTHENTIK_TYPE))
        );
    }

    #[test]
    fn test_map_groups_drops_unmapped() {
        let spec = spec(serde_json::json!({
            "type": "authentik",
            "groupMappings": {"g1": "developers", "g3": "admins"}
        }));
        let external = ["g3".to_string(), "g2".to_string(), "g1".to_string()];
        assert_eq!(spec.map_groups(&external), vec!["admins", "developers"]);
    }
}
