//! [`ClusterClient`] backed by a live API server.

use super::{ClientError, ClusterClient};
use crate::constants::OPERATOR_NAME;
use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::Client;
use serde_json::json;

#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

fn map_error(
    error: kube::Error,
    resource: &ApiResource,
    namespace: &str,
    name: &str,
) -> ClientError {
    match error {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound {
            kind: resource.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ClientError::AlreadyExists {
                kind: resource.kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict {
            kind: resource.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: ae.message.clone(),
        },
        kube::Error::Api(ae) => ClientError::Api {
            code: ae.code,
            message: ae.message.clone(),
        },
        kube::Error::SerdeError(e) => ClientError::Serialization(e),
        other => ClientError::Transport(other.to_string()),
    }
}

fn object_name(object: &DynamicObject) -> Result<&str, ClientError> {
    object
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ClientError::Invalid("object has no metadata.name".to_string()))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, ClientError> {
        self.api(resource, namespace)
            .get(name)
            .await
            .map_err(|e| map_error(e, resource, namespace, name))
    }

    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let name = object_name(object)?;
        self.api(resource, namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_error(e, resource, namespace, name))
    }

    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let name = object_name(object)?;
        self.api(resource, namespace)
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| map_error(e, resource, namespace, name))
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError> {
        // resourceVersion in a merge patch turns it into a precondition
        let patch = match resource_version {
            Some(version) => json!({
                "metadata": { "resourceVersion": version },
                "status": status,
            }),
            None => json!({ "status": status }),
        };

        self.api(resource, namespace)
            .patch_status(name, &PatchParams::apply(OPERATOR_NAME), &Patch::Merge(patch))
            .await
            .map_err(|e| map_error(e, resource, namespace, name))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_error(e, resource, namespace, name))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        self.api(resource, namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| map_error(e, resource, namespace, ""))
    }
}
