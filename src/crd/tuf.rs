//! # Tuf
//!
//! Metadata repository serving the trust root of the other components.

use super::{set_condition, Condition, ConditionsAware, ManagedResource, Pvc, SecretKeySelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sub-condition tracking the repository init job
pub const TUF_REPOSITORY_CONDITION: &str = "RepositoryAvailable";
/// Sub-condition tracking the server deployment
pub const TUF_SERVER_CONDITION: &str = "ServerAvailable";

/// Tuf Custom Resource Definition
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Tuf",
    group = "rhtas.redhat.com",
    version = "v1alpha1",
    namespaced,
    status = "TufStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TufSpec {
    /// Trusted keys published by the repository
    #[serde(default = "default_tuf_keys")]
    pub keys: Vec<TufKey>,
    /// Repository volume
    #[serde(default)]
    pub pvc: Pvc,
}

/// A trusted key published by the repository
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TufKey {
    /// File name in the repository (e.g. `rekor.pub`)
    pub name: String,
    /// Explicit source; discovered by the `rhtas.redhat.com/<name>` label when unset
    #[serde(default)]
    pub secret_ref: Option<SecretKeySelector>,
}

impl TufKey {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            secret_ref: None,
        }
    }
}

impl Default for TufSpec {
    fn default() -> Self {
        Self {
            keys: default_tuf_keys(),
            pvc: Pvc::default(),
        }
    }
}

pub fn default_tuf_keys() -> Vec<TufKey> {
    ["rekor.pub", "ctfe.pub", "fulcio_v1.crt.pem", "tsa.certchain.pem"]
        .into_iter()
        .map(TufKey::named)
        .collect()
}

/// Status of the Tuf resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TufStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Automatic recoveries since the last time the resource was Ready
    #[serde(default)]
    pub restarts: u32,
    /// Keys with their resolved sources
    #[serde(default)]
    pub keys: Vec<TufKey>,
    /// Repository claim
    #[serde(default)]
    pub pvc_name: Option<String>,
}

impl Tuf {
    pub fn status_mut(&mut self) -> &mut TufStatus {
        self.status.get_or_insert_with(TufStatus::default)
    }

    pub fn resolved_keys(&self) -> &[TufKey] {
        self.status.as_ref().map_or(&[], |s| s.keys.as_slice())
    }

    pub fn pvc_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.pvc_name.as_deref())
    }
}

impl ConditionsAware for Tuf {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.status_mut().conditions, condition);
    }
}

impl ManagedResource for Tuf {
    const COMPONENT: &'static str = "tuf";

    fn restarts(&self) -> u32 {
        self.status.as_ref().map_or(0, |s| s.restarts)
    }

    fn set_restarts(&mut self, restarts: u32) {
        self.status_mut().restarts = restarts;
    }

    fn reset_status_for_recovery(&mut self) {
        let previous = self.status.take().unwrap_or_default();
        self.status = Some(TufStatus {
            restarts: previous.restarts,
            keys: previous.keys,
            pvc_name: previous.pvc_name,
            ..TufStatus::default()
        });
    }
}
