use perm8s_k8s_util::error::{Result, is_kube_already_exists};
use perm8s_operator::crd::User;
use perm8s_operator::ownership::owned_metadata;

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, PostParams};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
const TOKEN_SECRET_SUFFIX: &str = "usertoken";

pub trait ServiceAccountExt {
    fn service_account_name(&self) -> String;
    fn token_secret_name(&self) -> String;
    fn desired_service_account(&self) -> Result<ServiceAccount>;
    fn desired_token_secret(&self) -> Result<Secret>;
}

impl ServiceAccountExt for User {
    #[inline]
    fn service_account_name(&self) -> String {
        self.name_any()
    }

    #[inline]
    fn token_secret_name(&self) -> String {
        format!("{}-{TOKEN_SECRET_SUFFIX}", self.service_account_name())
    }

    fn desired_service_account(&self) -> Result<ServiceAccount> {
        Ok(ServiceAccount {
            metadata: owned_metadata(
                self,
                &self.service_account_name(),
                self.namespace().as_deref(),
            )?,
            automount_service_account_token: Some(true),
            ..ServiceAccount::default()
        })
    }

    fn desired_token_secret(&self) -> Result<Secret> {
        let mut metadata =
            owned_metadata(self, &self.token_secret_name(), self.namespace().as_deref())?;
        metadata.annotations.get_or_insert_with(BTreeMap::new).insert(
            SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
            self.service_account_name(),
        );
        Ok(Secret {
            metadata,
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            ..Secret::default()
        })
    }
}

/// Creates `obj` unless an object with its name already exists. Existing objects are left as
/// they are. Returns whether the object was created.
pub async fn create_if_absent<K>(api: &Api<K>, obj: &K) -> Result<bool, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.name_any();
    if api.get_opt(&name).await?.is_some() {
        debug!(msg = format!("{} already exists", K::kind(&())), name);
        return Ok(false);
    }
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => {
            info!(msg = format!("{} created", K::kind(&())), name);
            Ok(true)
        }
        Err(e) if is_kube_already_exists(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Creates the service account of a user and its token secret when they are missing. Returns
/// whether the service account was created.
pub async fn ensure_identity(
    client: Client,
    namespace: &str,
    service_account: &ServiceAccount,
    token_secret: &Secret,
) -> Result<bool, kube::Error> {
    let created =
        create_if_absent(&Api::namespaced(client.clone(), namespace), service_account).await?;
    create_if_absent(&Api::namespaced(client, namespace), token_secret).await?;
    Ok(created)
}

#[cfg(test)]
mod test {
    use super::*;

    use perm8s_operator::ownership::OWNER_UID_LABEL;
    use perm8s_operator::test_util::TEST_NAMESPACE;

    #[test]
    fn token_secret_is_bound_to_the_service_account() {
        let user = User::test("jane-doe", &[]);
        let secret = user.desired_token_secret().unwrap();

        assert_eq!(secret.name_any(), "jane-doe-usertoken");
        assert_eq!(secret.namespace().as_deref(), Some(TEST_NAMESPACE));
        assert_eq!(secret.type_.as_deref(), Some(SERVICE_ACCOUNT_TOKEN_TYPE));
        assert_eq!(
            secret.annotations().get(SERVICE_ACCOUNT_NAME_ANNOTATION),
            Some(&"jane-doe".to_string())
        );
        assert_eq!(
            secret.labels().get(OWNER_UID_LABEL),
            Some(&"jane-doe-uid".to_string())
        );
        assert_eq!(secret.owner_references().len(), 1);
    }

    #[test]
    fn service_account_mounts_its_token() {
        let user = User::test("jane-doe", &[]);
        let service_account = user.desired_service_account().unwrap();

        assert_eq!(service_account.name_any(), "jane-doe");
        assert_eq!(service_account.automount_service_account_token, Some(true));
        assert_eq!(service_account.owner_references()[0].name, "jane-doe");
    }
}
