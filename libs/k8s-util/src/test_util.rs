//! In-memory Kubernetes API server for reconciler tests.
//!
//! Requests sent through the returned `kube::Client` are answered from a shared object map, so a
//! test can seed objects, run a reconcile pass, and then inspect the resulting state and the
//! writes that pass issued. Only the verbs the reconcilers use are supported: get, list (with
//! equality label selectors), create, replace, json/merge patch and delete.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::{Client, Resource};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tower_test::mock::Handle;

const EVENTS_API_PREFIX: &str = "/apis/events.k8s.io/";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    api_prefix: String,
    plural: String,
    namespace: Option<String>,
    name: String,
}

#[derive(Debug)]
struct ParsedPath {
    api_prefix: String,
    plural: String,
    namespace: Option<String>,
    name: Option<String>,
}

impl ParsedPath {
    fn parse(path: &str) -> Option<Self> {
        let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
        let prefix_len = match segments.first() {
            Some(&"api") => 2,
            Some(&"apis") => 3,
            _ => return None,
        };
        if segments.len() <= prefix_len {
            return None;
        }
        let api_prefix = format!("/{}", segments[..prefix_len].join("/"));
        let (namespace, rest) = match &segments[prefix_len..] {
            ["namespaces", ns, rest @ ..] if !rest.is_empty() => (Some(ns.to_string()), rest),
            rest => (None, rest),
        };
        let (plural, name) = match rest {
            [plural] => (plural.to_string(), None),
            [plural, name, ..] => (plural.to_string(), Some(name.to_string())),
            [] => return None,
        };
        Some(Self {
            api_prefix,
            plural,
            namespace,
            name,
        })
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey {
            api_prefix: self.api_prefix.clone(),
            plural: self.plural.clone(),
            namespace: self.namespace.clone(),
            name: name.to_string(),
        }
    }

    fn contains(&self, key: &ObjectKey) -> bool {
        key.api_prefix == self.api_prefix
            && key.plural == self.plural
            && (self.namespace.is_none() || key.namespace == self.namespace)
    }
}

/// A mutating request handled by the fake server, events excluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub method: Method,
    pub plural: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// An event published through the events API.
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub type_: String,
    pub reason: String,
    pub note: Option<String>,
    pub regarding: Option<String>,
}

#[derive(Clone, Debug)]
struct Failure {
    method: Method,
    plural: String,
    code: u16,
}

#[derive(Default)]
struct ServerState {
    objects: BTreeMap<ObjectKey, Value>,
    writes: Vec<Write>,
    events: Vec<RecordedEvent>,
    failures: Vec<Failure>,
    resource_version: u64,
}

impl ServerState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn store(&mut self, key: ObjectKey, mut object: Value) -> Value {
        let resource_version = self.next_resource_version();
        let existing_uid = self
            .objects
            .get(&key)
            .and_then(|o| o.pointer("/metadata/uid").cloned());
        let metadata = object
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert_with(|| json!({})));
        if let Some(Value::Object(metadata)) = metadata {
            metadata.insert("name".to_string(), Value::String(key.name.clone()));
            if let Some(ns) = &key.namespace {
                metadata.insert("namespace".to_string(), Value::String(ns.clone()));
            }
            let uid = existing_uid
                .or_else(|| metadata.get("uid").cloned())
                .unwrap_or_else(|| Value::String(uuid::Uuid::new_v4().to_string()));
            metadata.insert("uid".to_string(), uid);
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(resource_version),
            );
        }
        self.objects.insert(key, object.clone());
        object
    }

    fn record_event(&mut self, event: &Value) {
        let field = |name: &str| event.get(name).and_then(Value::as_str).map(str::to_string);
        self.events.push(RecordedEvent {
            type_: field("type").unwrap_or_default(),
            reason: field("reason").unwrap_or_default(),
            note: field("note"),
            regarding: event
                .pointer("/regarding/name")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
}

fn status_response(code: StatusCode, reason: &str, message: String) -> Response<Body> {
    let status = json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code.as_u16(),
    });
    json_response(code, &status)
}

fn json_response(code: StatusCode, value: &Value) -> Response<Body> {
    // safe unwrap: serializing a Value and building a response with a valid status cannot fail
    let body = serde_json::to_vec(value).unwrap();
    Response::builder()
        .status(code)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn label_selector_matches(selector: &str, object: &Value) -> bool {
    let labels = object.pointer("/metadata/labels");
    let label = |key: &str| labels.and_then(|l| l.get(key)).and_then(Value::as_str);
    selector
        .split(',')
        .filter(|requirement| !requirement.is_empty())
        .all(|requirement| {
            if let Some((key, value)) = requirement.split_once("!=") {
                label(key) != Some(value)
            } else if let Some((key, value)) = requirement
                .split_once("==")
                .or_else(|| requirement.split_once('='))
            {
                label(key) == Some(value)
            } else {
                label(requirement).is_some()
            }
        })
}

fn apply_json_patch(document: &mut Value, body: &[u8]) -> Result<(), String> {
    let patch: json_patch::Patch = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    // a `test` against null is how clients assert a field is absent
    let operations = patch
        .0
        .into_iter()
        .filter(|operation| match operation {
            json_patch::PatchOperation::Test(test) => {
                !(test.value.is_null() && document.pointer(test.path.as_str()).is_none())
            }
            _ => true,
        })
        .collect::<Vec<_>>();
    json_patch::patch(document, &operations).map_err(|e| e.to_string())
}

/// Shared handle on the state of a running fake API server.
#[derive(Clone, Default)]
pub struct FakeApiServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeApiServer {
    /// Starts a fake server and returns it with a client bound to it. Must be called inside a
    /// tokio runtime.
    pub fn start() -> (Self, Client) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let server = Self::default();
        tokio::spawn(server.clone().serve(handle));
        (server, Client::new(mock_service, "default"))
    }

    async fn serve(self, mut handle: Handle<Request<Body>, Response<Body>>) {
        while let Some((request, send)) = handle.next_request().await {
            let response = self.handle(request).await;
            send.send_response(response);
        }
    }

    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or_default().to_string();
        let content_type = request
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = match request.into_body().collect_bytes().await {
            Ok(body) => body.to_vec(),
            Err(e) => {
                return status_response(StatusCode::BAD_REQUEST, "BadRequest", e.to_string());
            }
        };

        let Some(parsed) = ParsedPath::parse(&path) else {
            return status_response(StatusCode::NOT_FOUND, "NotFound", path);
        };

        let mut state = self.state.lock();
        if let Some(failure) = state
            .failures
            .iter()
            .find(|f| f.method == method && f.plural == parsed.plural)
        {
            let code = StatusCode::from_u16(failure.code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return status_response(code, "InternalError", format!("injected failure on {path}"));
        }

        let is_event = path.starts_with(EVENTS_API_PREFIX);
        let response = match (&method, &parsed.name) {
            (&Method::GET, Some(name)) => match state.objects.get(&parsed.key(name)) {
                Some(object) => json_response(StatusCode::OK, object),
                None => not_found(&parsed, name),
            },
            (&Method::GET, None) => {
                let selector = url::form_urlencoded::parse(query.as_bytes())
                    .find(|(k, _)| k == "labelSelector")
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default();
                let items = state
                    .objects
                    .iter()
                    .filter(|(key, object)| {
                        parsed.contains(key) && label_selector_matches(&selector, object)
                    })
                    .map(|(_, object)| object.clone())
                    .collect::<Vec<_>>();
                let list = json!({
                    "apiVersion": "v1",
                    "kind": "List",
                    "metadata": { "resourceVersion": state.resource_version.to_string() },
                    "items": items,
                });
                json_response(StatusCode::OK, &list)
            }
            (&Method::POST, None) => {
                let object: Value = match serde_json::from_slice(&body) {
                    Ok(object) => object,
                    Err(e) => {
                        return status_response(
                            StatusCode::BAD_REQUEST,
                            "BadRequest",
                            e.to_string(),
                        );
                    }
                };
                let Some(name) = object.pointer("/metadata/name").and_then(Value::as_str) else {
                    return status_response(
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "Invalid",
                        "metadata.name is required".to_string(),
                    );
                };
                let key = parsed.key(name);
                if state.objects.contains_key(&key) {
                    status_response(
                        StatusCode::CONFLICT,
                        "AlreadyExists",
                        format!("{} \"{}\" already exists", parsed.plural, name),
                    )
                } else {
                    let stored = state.store(key, object);
                    if is_event {
                        state.record_event(&stored);
                    }
                    json_response(StatusCode::CREATED, &stored)
                }
            }
            (&Method::PUT, Some(name)) => {
                let object: Value = match serde_json::from_slice(&body) {
                    Ok(object) => object,
                    Err(e) => {
                        return status_response(
                            StatusCode::BAD_REQUEST,
                            "BadRequest",
                            e.to_string(),
                        );
                    }
                };
                let key = parsed.key(name);
                match state.objects.get(&key) {
                    None => not_found(&parsed, name),
                    Some(existing) => {
                        let current = existing.pointer("/metadata/resourceVersion").cloned();
                        let sent = object.pointer("/metadata/resourceVersion").cloned();
                        if sent.is_some() && sent != current {
                            status_response(
                                StatusCode::CONFLICT,
                                "Conflict",
                                format!(
                                    "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                                    parsed.plural, name
                                ),
                            )
                        } else {
                            json_response(StatusCode::OK, &state.store(key, object))
                        }
                    }
                }
            }
            (&Method::PATCH, Some(name)) => {
                let key = parsed.key(name);
                let Some(mut document) = state.objects.get(&key).cloned() else {
                    return not_found(&parsed, name);
                };
                let patched = if content_type.starts_with("application/json-patch") {
                    apply_json_patch(&mut document, &body)
                } else {
                    serde_json::from_slice::<Value>(&body)
                        .map(|patch| json_patch::merge(&mut document, &patch))
                        .map_err(|e| e.to_string())
                };
                match patched {
                    Ok(()) => {
                        let stored = state.store(key, document);
                        if is_event {
                            state.record_event(&stored);
                        }
                        json_response(StatusCode::OK, &stored)
                    }
                    Err(e) => status_response(StatusCode::UNPROCESSABLE_ENTITY, "Invalid", e),
                }
            }
            (&Method::DELETE, Some(name)) => match state.objects.remove(&parsed.key(name)) {
                Some(object) => json_response(StatusCode::OK, &object),
                None => not_found(&parsed, name),
            },
            _ => status_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                format!("{method} {path}"),
            ),
        };

        if !is_event && method != Method::GET && response.status().is_success() {
            state.writes.push(Write {
                method,
                plural: parsed.plural.clone(),
                namespace: parsed.namespace.clone(),
                name: parsed.name.clone().or_else(|| {
                    // creates carry the name in the body
                    serde_json::from_slice::<Value>(&body)
                        .ok()
                        .and_then(|o| {
                            o.pointer("/metadata/name")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                })
                .unwrap_or_default(),
            });
        }
        response
    }

    /// Stores `object` as if it had been created through the API.
    pub fn insert<K>(&self, object: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let key = object_key::<K>(object.meta().namespace.as_deref(), &object_name(object));
        // safe unwrap: Kubernetes objects always serialize to JSON
        let value = serde_json::to_value(object).unwrap();
        let stored = self.state.lock().store(key, value);
        serde_json::from_value(stored).unwrap()
    }

    pub fn get<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let key = object_key::<K>(namespace, name);
        self.state
            .lock()
            .objects
            .get(&key)
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// All stored objects of kind `K`, across namespaces.
    pub fn list<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let collection = ParsedPath::parse(&K::url_path(&(), None))
            .expect("kubernetes resources have a parsable url path");
        self.state
            .lock()
            .objects
            .iter()
            .filter(|(key, _)| collection.contains(key))
            .map(|(_, value)| serde_json::from_value(value.clone()).unwrap())
            .collect()
    }

    /// Mutating requests issued so far, in order. Events are not included.
    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().events.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Every later `method` request on resources named `plural` fails with `code`.
    pub fn fail_requests(&self, method: Method, plural: &str, code: u16) {
        self.state.lock().failures.push(Failure {
            method,
            plural: plural.to_string(),
            code,
        });
    }
}

fn not_found(parsed: &ParsedPath, name: &str) -> Response<Body> {
    status_response(
        StatusCode::NOT_FOUND,
        "NotFound",
        format!("{} \"{}\" not found", parsed.plural, name),
    )
}

fn object_name<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

fn object_key<K>(namespace: Option<&str>, name: &str) -> ObjectKey
where
    K: Resource<DynamicType = ()>,
{
    let collection = ParsedPath::parse(&K::url_path(&(), namespace))
        .expect("kubernetes resources have a parsable url path");
    collection.key(name)
}
