//! Builders shared by the reconciler tests of every perm8s crate.

use crate::controller::{ControllerId, State, Stores};
use crate::crd::{
    AuthentikSource, Group, GroupSpec, SynchronisationSource, SynchronisationSourceSpec, User,
    UserSpec,
};
use crate::metrics::Metrics;
use crate::prometheus_exporter::PrometheusExporter;

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::api::ObjectMeta;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher;
use opentelemetry::global;

pub const TEST_NAMESPACE: &str = "default";

fn test_metadata(name: &str, finalizer: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(TEST_NAMESPACE.to_string()),
        uid: Some(format!("{name}-uid")),
        finalizers: finalizer.map(|f| vec![f.to_string()]),
        ..ObjectMeta::default()
    }
}

impl Group {
    pub fn test(name: &str) -> Self {
        Group {
            metadata: test_metadata(name, None),
            spec: GroupSpec {
                display_name: name.to_string(),
                permissions: vec![PolicyRule {
                    api_groups: Some(vec![String::new()]),
                    resources: Some(vec!["pods".to_string()]),
                    verbs: vec!["get".to_string(), "list".to_string()],
                    ..PolicyRule::default()
                }],
                ..GroupSpec::default()
            },
        }
    }

    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.metadata.finalizers = Some(vec![finalizer.to_string()]);
        self
    }

    pub fn with_cluster_scope(mut self) -> Self {
        self.spec.cluster_group = true;
        self
    }

    pub fn with_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.spec.namespaces = namespaces.iter().map(|ns| ns.to_string()).collect();
        self
    }
}

impl User {
    pub fn test(name: &str, groups: &[&str]) -> Self {
        User {
            metadata: test_metadata(name, None),
            spec: UserSpec {
                display_name: name.to_string(),
                authentication_source: String::new(),
                group_memberships: groups.iter().map(|g| g.to_string()).collect(),
            },
        }
    }

    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.metadata.finalizers = Some(vec![finalizer.to_string()]);
        self
    }
}

impl SynchronisationSource {
    pub fn test(name: &str, type_: &str) -> Self {
        SynchronisationSource {
            metadata: test_metadata(name, None),
            spec: SynchronisationSourceSpec {
                type_: type_.to_string(),
                authentik: Some(AuthentikSource {
                    url: "authentik.example.com".to_string(),
                    scheme: "https".to_string(),
                    secret_name: "authentik-token".to_string(),
                    required_groups: Vec::new(),
                }),
                group_mappings: BTreeMap::new(),
            },
        }
    }

    pub fn with_mapping(mut self, external: &str, group: &str) -> Self {
        self.spec
            .group_mappings
            .insert(external.to_string(), group.to_string());
        self
    }
}

/// Writers of caches that tests fill by hand.
pub struct TestStores {
    pub group_writer: Writer<Group>,
    pub user_writer: Writer<User>,
    pub source_writer: Writer<SynchronisationSource>,
}

impl Default for TestStores {
    fn default() -> Self {
        Self {
            group_writer: Writer::default(),
            user_writer: Writer::default(),
            source_writer: Writer::default(),
        }
    }
}

impl TestStores {
    pub fn stores(&self) -> Stores {
        Stores::new(
            self.group_writer.as_reader(),
            self.user_writer.as_reader(),
            self.source_writer.as_reader(),
        )
    }

    pub fn apply_group(&mut self, group: &Group) {
        self.group_writer
            .apply_watcher_event(&watcher::Event::Apply(group.clone()));
    }

    pub fn apply_user(&mut self, user: &User) {
        self.user_writer
            .apply_watcher_event(&watcher::Event::Apply(user.clone()));
    }

    pub fn delete_user(&mut self, user: &User) {
        self.user_writer
            .apply_watcher_event(&watcher::Event::Delete(user.clone()));
    }

    pub fn apply_source(&mut self, source: &SynchronisationSource) {
        self.source_writer
            .apply_watcher_event(&watcher::Event::Apply(source.clone()));
    }

    pub fn state(&self, controllers: &[ControllerId]) -> State {
        let metrics = Metrics::new(&global::meter("test"), controllers);
        State::new(metrics, PrometheusExporter::new(), self.stores())
    }
}
