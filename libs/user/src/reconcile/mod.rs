pub mod binding;
pub mod service_account;

use self::binding::{BindingExt, ensure_binding, sweep_bindings};
use self::service_account::{ServiceAccountExt, ensure_identity};

use perm8s_k8s_util::error::{Error, Result};
use perm8s_operator::controller::context::{
    Context, REASON_CREATED, REASON_DELETED, REASON_FAILED, REASON_SYNCED,
};
use perm8s_operator::crd::{Group, User};
use perm8s_operator::ownership::owner_uid;

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::ResourceExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as Finalizer, finalizer};
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, info, instrument, warn};

pub static USER_FINALIZER: &str = "perm8s.io/user";

#[instrument(skip(ctx), fields(namespace = obj_ref.namespace.as_deref(), name = %obj_ref.name))]
pub async fn reconcile_user(obj_ref: ObjectRef<User>, ctx: Arc<Context>) -> Result<()> {
    let Some(user) = ctx.stores.user_store.get(&obj_ref) else {
        debug!(msg = "user no longer exists");
        return Ok(());
    };
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling user");

    let namespace = user.namespace().unwrap_or_default();
    let users_api: Api<User> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&users_api, USER_FINALIZER, user, |event| async {
        match event {
            Finalizer::Apply(u) => u.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(u) => u.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map(|_| ())
    .map_err(|e| Error::FinalizerError("failed on user finalizer".to_string(), Box::new(e)))
}

trait UserExt {
    fn member_groups(&self, ctx: &Context) -> Vec<Arc<Group>>;
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action>;
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action>;
}

impl UserExt for User {
    /// Groups of the user found in the cache. Memberships of unknown groups are skipped.
    fn member_groups(&self, ctx: &Context) -> Vec<Arc<Group>> {
        let namespace = self.namespace().unwrap_or_default();
        self.spec
            .group_memberships
            .iter()
            .filter_map(|name| {
                let group = ctx
                    .stores
                    .group_store
                    .get(&ObjectRef::new(name).within(&namespace));
                if group.is_none() {
                    warn!(msg = "group not found, skipping membership", group = name);
                }
                group
            })
            .collect()
    }

    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let namespace = self.namespace().unwrap_or_default();
        let uid = owner_uid(self)?;
        let service_account = self.desired_service_account()?;
        let token_secret = self.desired_token_secret()?;

        let identity =
            ensure_identity(ctx.client.clone(), &namespace, &service_account, &token_secret).await;
        match identity {
            Ok(true) => {
                ctx.publish_normal(
                    self,
                    REASON_CREATED,
                    "Creating",
                    format!(
                        "ServiceAccount {} created successfully",
                        self.service_account_name()
                    ),
                )
                .await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(msg = "failed to ensure service account of user", %e);
                ctx.publish_warning(
                    self,
                    REASON_FAILED,
                    "Reconciling",
                    format!(
                        "failed to ensure ServiceAccount {}: {e}",
                        self.service_account_name()
                    ),
                )
                .await;
                return Ok(Action::await_change());
            }
        }

        let groups = self.member_groups(&ctx);
        let desired = self.desired_bindings(groups.iter().map(|g| g.as_ref()))?;
        for binding in &desired.cluster {
            ensure_binding(ctx.client.clone(), binding).await?;
        }
        for binding in &desired.namespaced {
            ensure_binding(ctx.client.clone(), binding).await?;
        }

        let stale = sweep_bindings::<ClusterRoleBinding>(
            ctx.client.clone(),
            &uid,
            &desired.cluster_keys(),
        )
        .await?
            + sweep_bindings::<RoleBinding>(ctx.client.clone(), &uid, &desired.namespaced_keys())
                .await?;
        if stale > 0 {
            info!(msg = format!("removed {stale} stale bindings"));
        }

        ctx.publish_normal(
            self,
            REASON_SYNCED,
            "Reconciling",
            "User synced successfully".to_string(),
        )
        .await;
        Ok(Action::await_change())
    }

    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let uid = owner_uid(self)?;
        let keep = BTreeSet::new();
        let deleted = sweep_bindings::<ClusterRoleBinding>(ctx.client.clone(), &uid, &keep)
            .await?
            + sweep_bindings::<RoleBinding>(ctx.client.clone(), &uid, &keep).await?;

        info!(msg = format!("deleted {deleted} bindings of user"));
        ctx.publish_normal(
            self,
            REASON_DELETED,
            "Deleting",
            format!("{deleted} bindings deleted"),
        )
        .await;
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod test {
    use super::binding::role_ref_for;
    use super::*;

    use crate::controller::CONTROLLER_ID;

    use perm8s_k8s_util::test_util::FakeApiServer;
    use perm8s_operator::ownership::OWNER_UID_LABEL;
    use perm8s_operator::test_util::{TEST_NAMESPACE, TestStores};

    use http::Method;
    use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
    use k8s_openapi::api::rbac::v1::Subject;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    struct TestEnv {
        server: FakeApiServer,
        stores: TestStores,
        ctx: Arc<Context>,
    }

    fn test_env() -> TestEnv {
        let (server, client) = FakeApiServer::start();
        let stores = TestStores::default();
        let ctx = Arc::new(stores.state(&[CONTROLLER_ID]).to_context(client, CONTROLLER_ID));
        TestEnv { server, stores, ctx }
    }

    fn user_ref(name: &str) -> ObjectRef<User> {
        ObjectRef::new(name).within(TEST_NAMESPACE)
    }

    fn add_user(env: &mut TestEnv, user: User) -> User {
        let stored = env.server.insert(&user);
        env.stores.apply_user(&stored);
        stored
    }

    async fn reconcile(env: &TestEnv, name: &str) {
        reconcile_user(user_ref(name), env.ctx.clone()).await.unwrap();
    }

    fn role_binding_keys(server: &FakeApiServer) -> Vec<(Option<String>, String)> {
        server
            .list::<RoleBinding>()
            .iter()
            .map(|b| (b.namespace(), b.name_any()))
            .collect()
    }

    #[tokio::test]
    async fn user_not_in_cache_is_a_noop() {
        let env = test_env();
        reconcile(&env, "missing").await;
        assert!(env.server.writes().is_empty());
    }

    #[tokio::test]
    async fn cluster_group_membership_creates_cluster_role_binding() {
        let mut env = test_env();
        env.stores
            .apply_group(&Group::test("admins").with_cluster_scope());
        add_user(&mut env, User::test("jane", &["admins"]).with_finalizer(USER_FINALIZER));

        reconcile(&env, "jane").await;

        let service_account = env
            .server
            .get::<ServiceAccount>(Some(TEST_NAMESPACE), "jane")
            .unwrap();
        assert_eq!(service_account.automount_service_account_token, Some(true));
        assert!(
            env.server
                .get::<Secret>(Some(TEST_NAMESPACE), "jane-usertoken")
                .is_some()
        );
        let binding = env
            .server
            .get::<ClusterRoleBinding>(None, "jane-membership-admins")
            .unwrap();
        assert_eq!(binding.role_ref.name, "admins");
        assert!(env.server.list::<RoleBinding>().is_empty());
        assert_eq!(env.server.event_reasons(), vec!["Created", "Synced"]);
    }

    #[tokio::test]
    async fn namespaced_group_membership_creates_role_bindings() {
        let mut env = test_env();
        env.stores
            .apply_group(&Group::test("developers").with_namespaces(&["ns1", "ns2"]));
        add_user(
            &mut env,
            User::test("jane", &["developers"]).with_finalizer(USER_FINALIZER),
        );

        reconcile(&env, "jane").await;

        assert_eq!(
            role_binding_keys(&env.server),
            vec![
                (Some("ns1".to_string()), "jane-membership-developers".to_string()),
                (Some("ns2".to_string()), "jane-membership-developers".to_string()),
            ]
        );
        assert!(env.server.list::<ClusterRoleBinding>().is_empty());
    }

    #[tokio::test]
    async fn user_reconcile_is_idempotent() {
        let mut env = test_env();
        env.stores
            .apply_group(&Group::test("admins").with_cluster_scope());
        env.stores
            .apply_group(&Group::test("developers").with_namespaces(&["ns1"]));
        add_user(
            &mut env,
            User::test("jane", &["admins", "developers"]).with_finalizer(USER_FINALIZER),
        );

        reconcile(&env, "jane").await;
        env.server.clear_writes();
        reconcile(&env, "jane").await;

        assert!(env.server.writes().is_empty());
    }

    #[tokio::test]
    async fn missing_group_is_skipped() {
        let mut env = test_env();
        add_user(&mut env, User::test("jane", &["ghosts"]).with_finalizer(USER_FINALIZER));

        reconcile(&env, "jane").await;

        let plurals = env
            .server
            .writes()
            .into_iter()
            .map(|w| w.plural)
            .collect::<Vec<_>>();
        assert_eq!(plurals, vec!["serviceaccounts", "secrets"]);
        assert_eq!(env.server.event_reasons(), vec!["Created", "Synced"]);
    }

    #[tokio::test]
    async fn leaving_a_group_removes_its_binding() {
        let mut env = test_env();
        env.stores
            .apply_group(&Group::test("admins").with_cluster_scope());
        env.stores
            .apply_group(&Group::test("developers").with_cluster_scope());
        let mut user = add_user(
            &mut env,
            User::test("jane", &["admins", "developers"]).with_finalizer(USER_FINALIZER),
        );
        reconcile(&env, "jane").await;
        assert_eq!(env.server.list::<ClusterRoleBinding>().len(), 2);

        user.spec.group_memberships = vec!["admins".to_string()];
        env.stores.apply_user(&user);
        reconcile(&env, "jane").await;

        let bindings = env
            .server
            .list::<ClusterRoleBinding>()
            .iter()
            .map(|b| b.name_any())
            .collect::<Vec<_>>();
        assert_eq!(bindings, vec!["jane-membership-admins"]);
    }

    #[tokio::test]
    async fn group_switching_scope_moves_the_binding() {
        let mut env = test_env();
        env.stores
            .apply_group(&Group::test("developers").with_cluster_scope());
        add_user(
            &mut env,
            User::test("jane", &["developers"]).with_finalizer(USER_FINALIZER),
        );
        reconcile(&env, "jane").await;
        assert_eq!(env.server.list::<ClusterRoleBinding>().len(), 1);

        env.stores
            .apply_group(&Group::test("developers").with_namespaces(&["ns1"]));
        reconcile(&env, "jane").await;

        assert!(env.server.list::<ClusterRoleBinding>().is_empty());
        assert_eq!(
            role_binding_keys(&env.server),
            vec![(Some("ns1".to_string()), "jane-membership-developers".to_string())]
        );
    }

    #[tokio::test]
    async fn drifted_subjects_are_restored() {
        let mut env = test_env();
        let group = Group::test("admins").with_cluster_scope();
        env.stores.apply_group(&group);
        let user = add_user(
            &mut env,
            User::test("jane", &["admins"]).with_finalizer(USER_FINALIZER),
        );
        let mut drifted = user.desired_cluster_role_binding(&group).unwrap();
        drifted.subjects = Some(vec![Subject {
            kind: "User".to_string(),
            name: "mallory".to_string(),
            ..Subject::default()
        }]);
        env.server.insert(&drifted);

        reconcile(&env, "jane").await;

        let binding = env
            .server
            .get::<ClusterRoleBinding>(None, "jane-membership-admins")
            .unwrap();
        assert_eq!(binding.subjects, Some(vec![user.subject()]));
    }

    #[tokio::test]
    async fn existing_service_account_is_not_reported_as_created() {
        let mut env = test_env();
        let user = add_user(&mut env, User::test("jane", &[]).with_finalizer(USER_FINALIZER));
        env.server
            .insert(&user.desired_service_account().unwrap());

        reconcile(&env, "jane").await;

        assert_eq!(env.server.event_reasons(), vec!["Synced"]);
    }

    #[tokio::test]
    async fn unlabelled_binding_is_adopted_and_removed_on_leave() {
        let mut env = test_env();
        let group = Group::test("admins").with_cluster_scope();
        env.stores.apply_group(&group);
        let mut user = add_user(
            &mut env,
            User::test("jane", &["admins"]).with_finalizer(USER_FINALIZER),
        );
        env.server.insert(&ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some("jane-membership-admins".to_string()),
                ..ObjectMeta::default()
            },
            role_ref: role_ref_for(&group),
            subjects: Some(vec![user.subject()]),
        });

        reconcile(&env, "jane").await;

        let binding = env
            .server
            .get::<ClusterRoleBinding>(None, "jane-membership-admins")
            .unwrap();
        assert_eq!(
            binding.labels().get(OWNER_UID_LABEL),
            user.metadata.uid.as_ref()
        );

        user.spec.group_memberships = Vec::new();
        env.stores.apply_user(&user);
        reconcile(&env, "jane").await;

        assert!(env.server.list::<ClusterRoleBinding>().is_empty());
    }

    #[tokio::test]
    async fn binding_to_another_role_is_recreated() {
        let mut env = test_env();
        let group = Group::test("admins").with_cluster_scope();
        env.stores.apply_group(&group);
        let user = add_user(
            &mut env,
            User::test("jane", &["admins"]).with_finalizer(USER_FINALIZER),
        );
        let mut stale = user.desired_cluster_role_binding(&group).unwrap();
        stale.role_ref.name = "viewers".to_string();
        env.server.insert(&stale);
        env.server
            .insert(&user.desired_service_account().unwrap());
        env.server.insert(&user.desired_token_secret().unwrap());

        reconcile(&env, "jane").await;

        let binding = env
            .server
            .get::<ClusterRoleBinding>(None, "jane-membership-admins")
            .unwrap();
        assert_eq!(binding.role_ref.name, "admins");
        let methods = env
            .server
            .writes()
            .into_iter()
            .map(|w| w.method)
            .collect::<Vec<_>>();
        assert_eq!(methods, vec![Method::DELETE, Method::POST]);
    }

    #[tokio::test]
    async fn service_account_failure_ends_the_pass() {
        let mut env = test_env();
        env.stores
            .apply_group(&Group::test("admins").with_cluster_scope());
        add_user(&mut env, User::test("jane", &["admins"]).with_finalizer(USER_FINALIZER));
        env.server
            .fail_requests(Method::POST, "serviceaccounts", 500);

        reconcile(&env, "jane").await;

        assert!(env.server.list::<ClusterRoleBinding>().is_empty());
        assert_eq!(env.server.event_reasons(), vec!["Failed"]);
    }

    #[tokio::test]
    async fn binding_store_errors_propagate() {
        let mut env = test_env();
        env.stores
            .apply_group(&Group::test("admins").with_cluster_scope());
        add_user(&mut env, User::test("jane", &["admins"]).with_finalizer(USER_FINALIZER));
        env.server
            .fail_requests(Method::POST, "clusterrolebindings", 500);

        let result = reconcile_user(user_ref("jane"), env.ctx.clone()).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn user_deletion_removes_bindings_and_finalizer() {
        let mut env = test_env();
        let admins = Group::test("admins").with_cluster_scope();
        let developers = Group::test("developers").with_namespaces(&["ns1"]);
        let mut user = User::test("jane", &["admins", "developers"]).with_finalizer(USER_FINALIZER);
        user.metadata.deletion_timestamp = Some(Time(k8s_openapi::jiff::Timestamp::now()));
        let user = add_user(&mut env, user);
        env.server
            .insert(&user.desired_cluster_role_binding(&admins).unwrap());
        env.server
            .insert(&user.desired_role_binding(&developers, "ns1").unwrap());

        reconcile(&env, "jane").await;

        assert!(env.server.list::<ClusterRoleBinding>().is_empty());
        assert!(env.server.list::<RoleBinding>().is_empty());
        let user = env.server.get::<User>(Some(TEST_NAMESPACE), "jane").unwrap();
        assert!(user.finalizers().is_empty());
        assert_eq!(env.server.event_reasons(), vec!["Deleted"]);
    }
}
