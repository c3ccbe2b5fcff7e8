use crate::adapter::{AdapterRegistry, CredentialReader, SyncUser};

use perm8s_k8s_util::error::{Error, Result, is_kube_not_found};
use perm8s_k8s_util::types::normalize_identifier;
use perm8s_operator::controller::context::{
    Context, REASON_CREATED, REASON_DELETED, REASON_FAILED, REASON_SYNCED,
};
use perm8s_operator::crd::{SynchronisationSource, User, UserSpec};
use perm8s_operator::ownership::owned_metadata;

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::Arc;

use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

/// Context of the source reconciler: the shared controller context plus the identity adapters.
pub struct SourceContext {
    pub ctx: Context,
    pub registry: Arc<AdapterRegistry>,
    pub credentials: Arc<dyn CredentialReader>,
}

impl SourceContext {
    pub fn new(
        ctx: Context,
        registry: Arc<AdapterRegistry>,
        credentials: Arc<dyn CredentialReader>,
    ) -> Self {
        Self {
            ctx,
            registry,
            credentials,
        }
    }
}

impl Deref for SourceContext {
    type Target = Context;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

#[instrument(skip(ctx), fields(namespace = obj_ref.namespace.as_deref(), name = %obj_ref.name))]
pub async fn reconcile_source(
    obj_ref: ObjectRef<SynchronisationSource>,
    ctx: Arc<SourceContext>,
) -> Result<()> {
    let Some(source) = ctx.stores.source_store.get(&obj_ref) else {
        debug!(msg = "synchronisation source no longer exists");
        return Ok(());
    };
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling synchronisation source");

    let provider = match source.spec.provider() {
        Ok(provider) => provider,
        Err(e) => {
            warn!(msg = "cannot resolve provider of synchronisation source", %e);
            ctx.publish_warning(source.as_ref(), REASON_FAILED, "Synchronising", e.to_string())
                .await;
            return Ok(());
        }
    };
    let Some(adapter) = ctx.registry.get(&provider) else {
        warn!(msg = "no adapter registered", provider = provider.type_name());
        ctx.publish_warning(
            source.as_ref(),
            REASON_FAILED,
            "Synchronising",
            format!("no adapter registered for type '{}'", provider.type_name()),
        )
        .await;
        return Ok(());
    };
    let sync_users = match adapter
        .compute_users(&source, &provider, ctx.credentials.as_ref())
        .await
    {
        Ok(users) => users,
        Err(e) => {
            warn!(msg = "failed to compute users of synchronisation source", %e);
            ctx.publish_warning(
                source.as_ref(),
                REASON_FAILED,
                "Synchronising",
                format!("failed to list users from {}: {e}", provider.type_name()),
            )
            .await;
            return Ok(());
        }
    };

    let namespace = source.namespace().unwrap_or_default();
    let users_api: Api<User> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut identifiers = BTreeSet::new();
    for sync_user in &sync_users {
        let identifier = normalize_identifier(&sync_user.name, adapter.identifier_style());
        if identifier.is_empty() {
            warn!(
                msg = "external user has no usable identifier, skipping",
                user = sync_user.name
            );
            continue;
        }
        let desired = desired_user(&source, &identifier, sync_user)?;
        identifiers.insert(identifier.clone());
        sync_user_account(&ctx, &source, &users_api, desired).await?;
    }

    sweep_orphans(&ctx, &source, &users_api, &identifiers).await?;

    ctx.publish_normal(
        source.as_ref(),
        REASON_SYNCED,
        "Synchronising",
        format!("{} source has been synced successfully", provider.type_name()),
    )
    .await;
    Ok(())
}

/// User projected from `sync_user`, owned by `source`.
pub fn desired_user(
    source: &SynchronisationSource,
    identifier: &str,
    sync_user: &SyncUser,
) -> Result<User> {
    Ok(User {
        metadata: owned_metadata(source, identifier, source.namespace().as_deref())?,
        spec: UserSpec {
            display_name: sync_user.name.clone(),
            authentication_source: source.name_any(),
            group_memberships: source.spec.map_groups(&sync_user.groups),
        },
    })
}

async fn sync_user_account(
    ctx: &SourceContext,
    source: &SynchronisationSource,
    users_api: &Api<User>,
    desired: User,
) -> Result<()> {
    let name = desired.name_any();
    let current = users_api
        .get_opt(&name)
        .await
        .map_err(|e| Error::KubeError(format!("failed to get user {name}"), Box::new(e)))?;
    match current {
        None => {
            users_api
                .create(&PostParams::default(), &desired)
                .await
                .map_err(|e| {
                    Error::KubeError(format!("failed to create user {name}"), Box::new(e))
                })?;
            info!(msg = "user created for external user", user = name);
            ctx.publish_normal(
                source,
                REASON_CREATED,
                "Synchronising",
                format!("User {name} created for external user {}", desired.spec.display_name),
            )
            .await;
        }
        Some(current) if current.spec != desired.spec => {
            info!(msg = "user is out of sync, resyncing", user = name);
            let updated = User {
                spec: desired.spec,
                ..current
            };
            users_api
                .replace(&name, &PostParams::default(), &updated)
                .await
                .map_err(|e| {
                    Error::KubeError(format!("failed to update user {name}"), Box::new(e))
                })?;
        }
        Some(_) => debug!(msg = "user up to date", user = name),
    }
    Ok(())
}

/// Deletes the users of `source` whose external account is gone. Users already terminating are
/// left to their finalizer.
async fn sweep_orphans(
    ctx: &SourceContext,
    source: &SynchronisationSource,
    users_api: &Api<User>,
    identifiers: &BTreeSet<String>,
) -> Result<()> {
    let source_name = source.name_any();
    let users = users_api
        .list(&ListParams::default())
        .await
        .map_err(|e| Error::KubeError("failed to list users".to_string(), Box::new(e)))?;
    let orphans = users.items.iter().filter(|user| {
        user.is_managed_by(&source_name)
            && user.meta().deletion_timestamp.is_none()
            && !identifiers.contains(&user.name_any())
    });
    for user in orphans {
        let name = user.name_any();
        info!(msg = "user is orphaned and will be deleted", user = name);
        match users_api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_kube_not_found(&e) => continue,
            Err(e) => {
                return Err(Error::KubeError(
                    format!("failed to delete orphaned user {name}"),
                    Box::new(e),
                ));
            }
        }
        ctx.publish_normal(
            source,
            REASON_DELETED,
            "Synchronising",
            format!("orphaned User {name} deleted"),
        )
        .await;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::adapter::{ApiCredentialReader, IdentityAdapter};
    use crate::controller::CONTROLLER_ID;

    use perm8s_k8s_util::test_util::FakeApiServer;
    use perm8s_k8s_util::types::IdentifierStyle;
    use perm8s_operator::crd::{AUTHENTIK_TYPE, Provider};
    use perm8s_operator::test_util::{TEST_NAMESPACE, TestStores};

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use http::Method;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use parking_lot::Mutex;

    /// Reports a fixed user list, or fails when none is set.
    #[derive(Default)]
    struct StaticAdapter {
        users: Mutex<Option<Vec<SyncUser>>>,
    }

    impl StaticAdapter {
        fn set_users(&self, users: Vec<SyncUser>) {
            *self.users.lock() = Some(users);
        }
    }

    impl IdentityAdapter for StaticAdapter {
        fn identifier_style(&self) -> IdentifierStyle {
            IdentifierStyle::Separated('-')
        }

        fn compute_users<'a>(
            &'a self,
            _source: &'a SynchronisationSource,
            _provider: &'a Provider,
            _credentials: &'a dyn CredentialReader,
        ) -> BoxFuture<'a, Result<Vec<SyncUser>>> {
            let users = self
                .users
                .lock()
                .clone()
                .ok_or_else(|| Error::MissingData("identity provider unreachable".to_string()));
            futures::future::ready(users).boxed()
        }
    }

    struct TestEnv {
        server: FakeApiServer,
        stores: TestStores,
        adapter: Arc<StaticAdapter>,
        ctx: Arc<SourceContext>,
    }

    fn test_env_with_registry(
        registry: impl FnOnce(Arc<StaticAdapter>) -> AdapterRegistry,
    ) -> TestEnv {
        let (server, client) = FakeApiServer::start();
        let stores = TestStores::default();
        let adapter = Arc::new(StaticAdapter::default());
        let ctx = Arc::new(SourceContext::new(
            stores.state(&[CONTROLLER_ID]).to_context(client.clone(), CONTROLLER_ID),
            Arc::new(registry(adapter.clone())),
            Arc::new(ApiCredentialReader::new(client)),
        ));
        TestEnv {
            server,
            stores,
            adapter,
            ctx,
        }
    }

    fn test_env() -> TestEnv {
        test_env_with_registry(|adapter| {
            AdapterRegistry::empty().with_adapter(AUTHENTIK_TYPE, adapter)
        })
    }

    fn add_source(env: &mut TestEnv, source: SynchronisationSource) -> SynchronisationSource {
        let stored = env.server.insert(&source);
        env.stores.apply_source(&stored);
        stored
    }

    async fn reconcile(env: &TestEnv, name: &str) -> Result<()> {
        reconcile_source(ObjectRef::new(name).within(TEST_NAMESPACE), env.ctx.clone()).await
    }

    fn user_names(server: &FakeApiServer) -> Vec<String> {
        server.list::<User>().iter().map(|u| u.name_any()).collect()
    }

    fn managed_user(source: &str, name: &str) -> User {
        let mut user = User::test(name, &[]);
        user.spec.authentication_source = source.to_string();
        user
    }

    #[tokio::test]
    async fn source_not_in_cache_is_a_noop() {
        let env = test_env();
        reconcile(&env, "missing").await.unwrap();
        assert!(env.server.writes().is_empty());
        assert!(env.server.events().is_empty());
    }

    #[tokio::test]
    async fn external_users_become_users() {
        let mut env = test_env();
        let source = add_source(
            &mut env,
            SynchronisationSource::test("authentik", AUTHENTIK_TYPE)
                .with_mapping("g-dev", "developers")
                .with_mapping("g-ops", "admins"),
        );
        env.adapter.set_users(vec![
            SyncUser::new("Jane Doe", &["g-ops", "g-unmapped", "g-dev"]),
            SyncUser::new("john", &[]),
        ]);

        reconcile(&env, "authentik").await.unwrap();

        assert_eq!(user_names(&env.server), vec!["jane-doe", "john"]);
        let jane = env
            .server
            .get::<User>(Some(TEST_NAMESPACE), "jane-doe")
            .unwrap();
        assert_eq!(jane.spec.display_name, "Jane Doe");
        assert_eq!(jane.spec.authentication_source, "authentik");
        assert_eq!(jane.spec.group_memberships, vec!["admins", "developers"]);
        assert_eq!(jane.owner_references()[0].uid, source.metadata.uid.unwrap());
        assert_eq!(
            env.server.event_reasons(),
            vec!["Created", "Created", "Synced"]
        );
    }

    #[tokio::test]
    async fn source_reconcile_is_idempotent() {
        let mut env = test_env();
        add_source(
            &mut env,
            SynchronisationSource::test("authentik", AUTHENTIK_TYPE).with_mapping("g1", "admins"),
        );
        env.adapter
            .set_users(vec![SyncUser::new("jane", &["g1"]), SyncUser::new("john", &[])]);

        reconcile(&env, "authentik").await.unwrap();
        env.server.clear_writes();
        reconcile(&env, "authentik").await.unwrap();

        assert!(env.server.writes().is_empty());
    }

    #[tokio::test]
    async fn changed_memberships_are_updated() {
        let mut env = test_env();
        add_source(
            &mut env,
            SynchronisationSource::test("authentik", AUTHENTIK_TYPE)
                .with_mapping("g1", "admins")
                .with_mapping("g2", "developers"),
        );
        env.adapter.set_users(vec![SyncUser::new("jane", &["g1"])]);
        reconcile(&env, "authentik").await.unwrap();

        env.adapter.set_users(vec![SyncUser::new("jane", &["g2"])]);
        env.server.clear_writes();
        reconcile(&env, "authentik").await.unwrap();

        let jane = env.server.get::<User>(Some(TEST_NAMESPACE), "jane").unwrap();
        assert_eq!(jane.spec.group_memberships, vec!["developers"]);
        assert_eq!(env.server.writes().len(), 1);
        assert_eq!(env.server.writes()[0].method, Method::PUT);
    }

    #[tokio::test]
    async fn orphaned_users_are_deleted() {
        let mut env = test_env();
        add_source(&mut env, SynchronisationSource::test("authentik", AUTHENTIK_TYPE));
        for name in ["a", "b", "c"] {
            env.server.insert(&managed_user("authentik", name));
        }
        env.server.insert(&managed_user("other-source", "d"));
        env.server.insert(&User::test("e", &[]));
        env.adapter
            .set_users(vec![SyncUser::new("a", &[]), SyncUser::new("c", &[])]);

        reconcile(&env, "authentik").await.unwrap();

        assert_eq!(user_names(&env.server), vec!["a", "c", "d", "e"]);
        assert!(env.server.event_reasons().contains(&REASON_DELETED.to_string()));
    }

    #[tokio::test]
    async fn terminating_users_are_not_deleted_again() {
        let mut env = test_env();
        add_source(&mut env, SynchronisationSource::test("authentik", AUTHENTIK_TYPE));
        let mut user = managed_user("authentik", "b");
        user.metadata.finalizers = Some(vec!["perm8s.io/user".to_string()]);
        user.metadata.deletion_timestamp = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        env.server.insert(&user);
        env.adapter.set_users(Vec::new());

        reconcile(&env, "authentik").await.unwrap();

        assert!(env.server.writes().is_empty());
        assert_eq!(user_names(&env.server), vec!["b"]);
        assert_eq!(env.server.event_reasons(), vec![REASON_SYNCED]);
    }

    #[tokio::test]
    async fn update_conflict_is_returned_for_retry() {
        let mut env = test_env();
        add_source(
            &mut env,
            SynchronisationSource::test("authentik", AUTHENTIK_TYPE)
                .with_mapping("g1", "admins")
                .with_mapping("g2", "developers"),
        );
        env.adapter.set_users(vec![SyncUser::new("jane", &["g1"])]);
        reconcile(&env, "authentik").await.unwrap();

        env.adapter.set_users(vec![SyncUser::new("jane", &["g2"])]);
        env.server.fail_requests(Method::PUT, "users", 409);
        let result = reconcile(&env, "authentik").await;

        let Err(Error::KubeError(_, error)) = result else {
            panic!("expected a kube error");
        };
        assert!(matches!(error.as_ref(), kube::Error::Api(status) if status.code == 409));
        let jane = env.server.get::<User>(Some(TEST_NAMESPACE), "jane").unwrap();
        assert_eq!(jane.spec.group_memberships, vec!["admins"]);
    }

    #[tokio::test]
    async fn orphan_delete_failure_propagates() {
        let mut env = test_env();
        add_source(&mut env, SynchronisationSource::test("authentik", AUTHENTIK_TYPE));
        env.server.insert(&managed_user("authentik", "b"));
        env.adapter.set_users(Vec::new());
        env.server.fail_requests(Method::DELETE, "users", 500);

        assert!(reconcile(&env, "authentik").await.is_err());
    }

    #[tokio::test]
    async fn unknown_source_type_only_warns() {
        let mut env = test_env();
        add_source(&mut env, SynchronisationSource::test("directory", "ldap"));

        reconcile(&env, "directory").await.unwrap();

        assert!(env.server.writes().is_empty());
        let events = env.server.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, "Warning");
        assert_eq!(events[0].reason, REASON_FAILED);
    }

    #[tokio::test]
    async fn missing_adapter_only_warns() {
        let mut env = test_env_with_registry(|_| AdapterRegistry::empty());
        add_source(&mut env, SynchronisationSource::test("authentik", AUTHENTIK_TYPE));

        reconcile(&env, "authentik").await.unwrap();

        assert!(env.server.writes().is_empty());
        assert_eq!(env.server.event_reasons(), vec![REASON_FAILED]);
    }

    #[tokio::test]
    async fn adapter_failure_only_warns() {
        let mut env = test_env();
        add_source(&mut env, SynchronisationSource::test("authentik", AUTHENTIK_TYPE));
        env.server.insert(&managed_user("authentik", "jane"));

        reconcile(&env, "authentik").await.unwrap();

        assert!(env.server.writes().is_empty());
        assert_eq!(user_names(&env.server), vec!["jane"]);
        assert_eq!(env.server.event_reasons(), vec![REASON_FAILED]);
    }

    #[tokio::test]
    async fn users_without_identifier_are_skipped() {
        let mut env = test_env();
        add_source(&mut env, SynchronisationSource::test("authentik", AUTHENTIK_TYPE));
        env.adapter
            .set_users(vec![SyncUser::new("!!!", &[]), SyncUser::new("jane", &[])]);

        reconcile(&env, "authentik").await.unwrap();

        assert_eq!(user_names(&env.server), vec!["jane"]);
    }
}
