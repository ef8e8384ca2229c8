//! # Cluster Client
//!
//! Narrow view of the Kubernetes API used by actions and the reconciler.
//!
//! Every call works on [`DynamicObject`]s addressed by an [`ApiResource`], so a
//! single trait object covers the managed CRDs and the child workloads. The
//! typed helpers at the bottom of this module convert through JSON.
//!
//! - [`KubeClusterClient`] talks to a real API server
//! - [`InMemoryClient`] keeps objects in memory, with the same optimistic
//!   concurrency semantics, for tests and dry runs

mod kube_client;
mod memory;

pub use kube_client::KubeClusterClient;
pub use memory::{matches_selector, InMemoryClient, InjectedFailure, Operation};

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors returned by a [`ClusterClient`]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Kubernetes client error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ClientError::Conflict { .. } | ClientError::AlreadyExists { .. }
        )
    }

    /// Whether retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Conflict { .. }
            | ClientError::AlreadyExists { .. }
            | ClientError::Transport(_) => true,
            ClientError::Api { code, .. } => *code == 429 || *code >= 500,
            ClientError::NotFound { .. }
            | ClientError::Invalid(_)
            | ClientError::Serialization(_) => false,
        }
    }
}

/// Kubernetes API operations needed by the operator
///
/// Watches are not part of this trait; they are driven by kube-runtime.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object, [`ClientError::NotFound`] when absent
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, ClientError>;

    /// Create an object, [`ClientError::AlreadyExists`] when the name is taken
    async fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Replace an object; a stale `metadata.resourceVersion` yields
    /// [`ClientError::Conflict`]
    async fn update(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Replace the status subresource
    ///
    /// When `resource_version` is set the write only succeeds against that
    /// exact version.
    async fn update_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &serde_json::Value,
    ) -> Result<DynamicObject, ClientError>;

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    /// List objects in a namespace, optionally filtered by a label selector
    /// (`key=value` and bare `key` terms separated by commas)
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError>;
}

/// Convert a typed object into a [`DynamicObject`]
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, ClientError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Convert a [`DynamicObject`] back into a typed object
pub fn from_dynamic<K: DeserializeOwned>(object: DynamicObject) -> Result<K, ClientError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Typed [`ClusterClient::get`]
pub async fn get_typed<K>(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<K, ClientError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let object = client.get(&api_resource::<K>(), namespace, name).await?;
    from_dynamic(object)
}

/// Typed get that maps NotFound to `None`
pub async fn get_opt<K>(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, ClientError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match get_typed(client, namespace, name).await {
        Ok(object) => Ok(Some(object)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub async fn create_typed<K>(
    client: &dyn ClusterClient,
    namespace: &str,
    object: &K,
) -> Result<K, ClientError>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let created = client
        .create(&api_resource::<K>(), namespace, &to_dynamic(object)?)
        .await?;
    from_dynamic(created)
}

pub async fn list_typed<K>(
    client: &dyn ClusterClient,
    namespace: &str,
    label_selector: Option<&str>,
) -> Result<Vec<K>, ClientError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    client
        .list(&api_resource::<K>(), namespace, label_selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}
