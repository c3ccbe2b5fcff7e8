//! Identity adapters turn the configuration of a synchronisation source into the list of
//! external users to project as perm8s Users.

pub mod authentik;

use self::authentik::AuthentikAdapter;

use perm8s_k8s_util::error::{Error, Result};
use perm8s_k8s_util::types::IdentifierStyle;
use perm8s_operator::crd::{AUTHENTIK_TYPE, Provider, SynchronisationSource};

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;

/// External user reported by an adapter for one synchronisation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncUser {
    /// Account name, normalized into the User name.
    pub name: String,
    /// External group ids.
    pub groups: Vec<String>,
}

impl SyncUser {
    pub fn new(name: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            name: name.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }
}

/// Read access to the secrets holding provider credentials.
pub trait CredentialReader: Send + Sync {
    fn read_secret<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Secret>>>;
}

pub struct ApiCredentialReader {
    client: Client,
}

impl ApiCredentialReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl CredentialReader for ApiCredentialReader {
    fn read_secret<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Secret>>> {
        Box::pin(async move {
            Api::<Secret>::namespaced(self.client.clone(), namespace)
                .get_opt(name)
                .await
                .map_err(|e| {
                    Error::KubeError(
                        format!("failed to get secret {namespace}/{name}"),
                        Box::new(e),
                    )
                })
        })
    }
}

pub trait IdentityAdapter: Send + Sync {
    /// How account names of this provider become User names.
    fn identifier_style(&self) -> IdentifierStyle;

    fn compute_users<'a>(
        &'a self,
        source: &'a SynchronisationSource,
        provider: &'a Provider,
        credentials: &'a dyn CredentialReader,
    ) -> BoxFuture<'a, Result<Vec<SyncUser>>>;
}

/// Adapters by provider type.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn IdentityAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(
        mut self,
        type_name: &'static str,
        adapter: Arc<dyn IdentityAdapter>,
    ) -> Self {
        self.adapters.insert(type_name, adapter);
        self
    }

    pub fn get(&self, provider: &Provider) -> Option<Arc<dyn IdentityAdapter>> {
        self.adapters.get(provider.type_name()).cloned()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::empty().with_adapter(AUTHENTIK_TYPE, Arc::new(AuthentikAdapter::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use perm8s_operator::crd::AuthentikSource;

    #[test]
    fn test_default_registry_serves_authentik() {
        let provider = Provider::Authentik(AuthentikSource::default());
        let adapter = AdapterRegistry::default().get(&provider).unwrap();
        assert_eq!(adapter.identifier_style(), IdentifierStyle::Separated('-'));
        assert!(AdapterRegistry::empty().get(&provider).is_none());
    }
}
