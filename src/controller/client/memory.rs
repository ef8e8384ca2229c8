//! [`ClusterClient`] that keeps objects in process memory.
//!
//! Mirrors the API server behaviour the reconciler relies on:
//!
//! - every write assigns a new `metadata.resourceVersion`
//! - writes carrying a stale `resourceVersion` fail with a conflict
//! - `update` never touches `status`, `update_status` touches nothing else
//! - `create` assigns `metadata.uid` and drops any `status`
//!
//! Calls are counted per kind and operation, and failures can be queued for
//! the next matching call.

use super::{ClientError, ClusterClient};
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

/// Operation kinds tracked by [`InMemoryClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
    List,
}

/// Failure returned by the next matching call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    Conflict,
    Unavailable,
    Api(u16),
}

type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_version: u64,
    calls: HashMap<(String, Operation), usize>,
    failures: VecDeque<(String, Operation, InjectedFailure)>,
}

#[derive(Debug, Default)]
pub struct InMemoryClient {
    state: Mutex<State>,
}

fn key(resource: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
    (
        format!("{}/{}", resource.api_version, resource.kind),
        namespace.to_string(),
        name.to_string(),
    )
}

fn not_found(resource: &ApiResource, namespace: &str, name: &str) -> ClientError {
    ClientError::NotFound {
        kind: resource.kind.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn conflict(resource: &ApiResource, namespace: &str, name: &str, message: &str) -> ClientError {
    ClientError::Conflict {
        kind: resource.kind.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Match labels against a selector of `k=v`, `k==v`, `k!=v`, `k` and `!k` terms
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

impl State {
    fn record(
        &mut self,
        resource: &ApiResource,
        operation: Operation,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        *self
            .calls
            .entry((resource.kind.clone(), operation))
            .or_default() += 1;

        let position = self
            .failures
            .iter()
            .position(|(kind, op, _)| *kind == resource.kind && *op == operation);
        match position.and_then(|i| self.failures.remove(i)) {
            Some((_, _, InjectedFailure::Conflict)) => {
                Err(conflict(resource, namespace, name, "injected conflict"))
            }
            Some((_, _, InjectedFailure::Unavailable)) => {
                Err(ClientError::Transport("injected: connection refused".to_string()))
            }
            Some((_, _, InjectedFailure::Api(code))) => Err(ClientError::Api {
                code,
                message: "injected failure".to_string(),
            }),
            None => Ok(()),
        }
    }

    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicking test must not poison the other assertions
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store an object as-is (status included), bypassing call accounting
    pub fn seed(&self, resource: &ApiResource, object: DynamicObject) -> DynamicObject {
        let mut state = self.lock();
        let mut object = object;
        let namespace = object
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let name = object.metadata.name.clone().unwrap_or_default();
        object.metadata.namespace = Some(namespace.clone());
        if object.metadata.uid.is_none() {
            object.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        object.metadata.resource_version = Some(state.bump_version());
        state
            .objects
            .insert(key(resource, &namespace, &name), object.clone());
        object
    }

    /// Number of calls of `operation` made against `kind`
    pub fn calls(&self, kind: &str, operation: Operation) -> usize {
        self.lock()
            .calls
            .get(&(kind.to_string(), operation))
            .copied()
            .unwrap_or(0)
    }

    /// Fail the next `operation` against `kind`
    pub fn fail_next(&self, kind: &str, operation: Operation, failure: InjectedFailure) {
        self.lock()
            .failures
            .push_back((kind.to_string(), operation, failure));
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: &str) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|(k, _, _)| k.rsplit('/').next() == Some(kind))
            .count()
    }
}

#[async_trait]
impl ClusterClient for InMemoryClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, ClientError> {
        let mut state = self.lock();
        state.record(resource, Operation::Get, namespace, name)?;
        state
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
            .ok_or_else(|| not_found(resource, namespace, name))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClientError::Invalid("object has no metadata.name".to_string()))?;
        let mut state = self.lock();
        state.record(resource, Operation::Create, namespace, &name)?;

        let k = key(resource, namespace, &name);
        if state.objects.contains_key(&k) {
            return Err(ClientError::AlreadyExists {
                kind: resource.kind.clone(),
                namespace: namespace.to_string(),
                name,
            });
        }

        let mut stored = object.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(state.bump_version());
        if let Some(data) = stored.data.as_object_mut() {
            data.remove("status");
        }
        state.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClientError::Invalid("object has no metadata.name".to_string()))?;
        let mut state = self.lock();
        state.record(resource, Operation::Update, namespace, &name)?;

        let k = key(resource, namespace, &name);
        let current = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(resource, namespace, &name))?;
        if object.metadata.resource_version.is_some()
            && object.metadata.resource_version != current.metadata.resource_version
        {
            return Err(conflict(
                resource,
                namespace,
                &name,
                "the object has been modified",
            ));
        }

        let mut stored = object.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.resource_version = Some(state.bump_version());
        if let Some(data) = stored.data.as_object_mut() {
            match current.data.get("status") {
                Some(status) => {
                    data.insert("status".to_string(), status.clone());
                }
                None => {
                    data.remove("status");
                }
            }
        }
        state.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError> {
        let mut state = self.lock();
        state.record(resource, Operation::UpdateStatus, namespace, name)?;

        let k = key(resource, namespace, name);
        let mut stored = state
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| not_found(resource, namespace, name))?;
        if let Some(version) = resource_version {
            if stored.metadata.resource_version.as_deref() != Some(version) {
                return Err(conflict(
                    resource,
                    namespace,
                    name,
                    "the object has been modified",
                ));
            }
        }

        if !stored.data.is_object() {
            stored.data = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(data) = stored.data.as_object_mut() {
            data.insert("status".to_string(), status.clone());
        }
        stored.metadata.resource_version = Some(state.bump_version());
        state.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        state.record(resource, Operation::Delete, namespace, name)?;
        state
            .objects
            .remove(&key(resource, namespace, name))
            .map(|_| ())
            .ok_or_else(|| not_found(resource, namespace, name))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let mut state = self.lock();
        state.record(resource, Operation::List, namespace, "")?;
        let kind_key = format!("{}/{}", resource.api_version, resource.kind);
        let empty = BTreeMap::new();
        Ok(state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind_key && ns == namespace)
            .map(|(_, object)| object)
            .filter(|object| {
                label_selector.is_none_or(|selector| {
                    matches_selector(object.metadata.labels.as_ref().unwrap_or(&empty), selector)
                })
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::{api_resource, create_typed, get_typed, to_dynamic};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_matches_selector_terms() {
        let labels: BTreeMap<String, String> = [("app".to_string(), "ctlog".to_string())]
            .into_iter()
            .collect();
        assert!(matches_selector(&labels, "app=ctlog"));
        assert!(matches_selector(&labels, "app==ctlog"));
        assert!(matches_selector(&labels, "app"));
        assert!(matches_selector(&labels, "app!=rekor"));
        assert!(matches_selector(&labels, "!tier"));
        assert!(!matches_selector(&labels, "app=rekor"));
        assert!(!matches_selector(&labels, "app,tier"));
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_rejects_duplicates() {
        let client = InMemoryClient::new();
        let created = create_typed(&client, "ns", &config_map("a", &[])).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());

        let err = create_typed(&client, "ns", &config_map("a", &[]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(client.calls("ConfigMap", Operation::Create), 2);
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let client = InMemoryClient::new();
        let ar = api_resource::<ConfigMap>();
        let created = create_typed(&client, "ns", &config_map("a", &[])).await.unwrap();
        let stale = created.metadata.resource_version.clone();

        client
            .update(&ar, "ns", &to_dynamic(&created).unwrap())
            .await
            .unwrap();

        let err = client
            .update_status(&ar, "ns", "a", stale.as_deref(), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_update_preserves_status() {
        let client = InMemoryClient::new();
        let ar = api_resource::<ConfigMap>();
        create_typed(&client, "ns", &config_map("a", &[])).await.unwrap();
        client
            .update_status(&ar, "ns", "a", None, &serde_json::json!({"phase": "x"}))
            .await
            .unwrap();

        let fetched = client.get(&ar, "ns", "a").await.unwrap();
        let mut replaced = fetched.clone();
        replaced.data["status"] = serde_json::json!({"phase": "overwritten"});
        let updated = client.update(&ar, "ns", &replaced).await.unwrap();

        assert_eq!(updated.data["status"]["phase"], "x");
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let client = InMemoryClient::new();
        client.fail_next("ConfigMap", Operation::Get, InjectedFailure::Unavailable);

        let first = get_typed::<ConfigMap>(&client, "ns", "missing").await.unwrap_err();
        assert!(matches!(first, ClientError::Transport(_)));

        let second = get_typed::<ConfigMap>(&client, "ns", "missing").await.unwrap_err();
        assert!(second.is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace_and_labels() {
        let client = InMemoryClient::new();
        let ar = api_resource::<ConfigMap>();
        create_typed(&client, "ns", &config_map("a", &[("app", "ctlog")])).await.unwrap();
        create_typed(&client, "ns", &config_map("b", &[("app", "rekor")])).await.unwrap();
        create_typed(&client, "other", &config_map("c", &[("app", "ctlog")])).await.unwrap();

        let listed = client.list(&ar, "ns", Some("app=ctlog")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.name.as_deref(), Some("a"));
        assert_eq!(client.count("ConfigMap"), 3);
    }
}
