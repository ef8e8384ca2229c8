//! # Custom Resource Definitions
//!
//! CRD types for the Securesign operator.
//!
//! Every managed kind carries a user-owned `spec` and an operator-owned
//! `status`. The status is the only durable state the operator keeps; it
//! holds the phase conditions, the restart counter and cached references to
//! generated or resolved artifacts.

mod ctlog;
mod rekor;
mod status;
mod timestamp_authority;
mod trillian;
mod tuf;

pub use ctlog::*;
pub use rekor::*;
pub use status::*;
pub use timestamp_authority::*;
pub use trillian::*;
pub use tuf::*;

use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

/// Reference to a single key of a Secret in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    /// Secret name
    pub name: String,
    /// Key within the Secret's data
    pub key: String,
}

impl SecretKeySelector {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

/// Persistent volume claim settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Pvc {
    /// Requested size (Kubernetes quantity)
    #[serde(default = "default_pvc_size")]
    pub size: String,
    /// Storage class; cluster default when unset
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl Default for Pvc {
    fn default() -> Self {
        Self {
            size: default_pvc_size(),
            storage_class: None,
        }
    }
}

fn default_pvc_size() -> String {
    "5Gi".to_string()
}

fn default_true() -> bool {
    true
}

/// A resource driven by the reconciliation engine
///
/// Implemented explicitly by every CRD kind so the generic actions never
/// need to know the shape of a concrete status.
pub trait ManagedResource:
    Resource<DynamicType = ()>
    + ConditionsAware
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Component name used for labels, events and metrics
    const COMPONENT: &'static str;

    fn restarts(&self) -> u32;

    fn set_restarts(&mut self, restarts: u32);

    /// Replace the status with a fresh one that only keeps fields proven
    /// safe to reuse after a failure (resolved identifiers, issued key
    /// material, issued configuration).
    ///
    /// The restart counter is carried over; conditions other than the
    /// sub-conditions of preserved fields are dropped.
    fn reset_status_for_recovery(&mut self);
}

/// A resource backed by a Trillian log tree
pub trait TreeIdentified: ManagedResource {
    /// Tree id pinned by the user
    fn spec_tree_id(&self) -> Option<i64>;

    /// Tree id in use
    fn status_tree_id(&self) -> Option<i64>;

    fn set_status_tree_id(&mut self, tree_id: i64);
}

/// Namespace of a managed resource, `default` when unset
pub fn namespace_of<K: Resource>(resource: &K) -> String {
    resource
        .meta()
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

/// Name of a managed resource, `unknown` when unset
pub fn name_of<K: Resource>(resource: &K) -> String {
    resource
        .meta()
        .name
        .clone()
        .unwrap_or_else(|| "unknown".to_string())
}
