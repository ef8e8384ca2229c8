//! # Rekor
//!
//! Transparency log server backed by a Trillian tree.

use super::{
    find_condition, set_condition, Condition, ConditionsAware, ManagedResource, Pvc,
    SecretKeySelector, TreeIdentified,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sub-condition tracking the signer key
pub const REKOR_SIGNER_CONDITION: &str = "SignerAvailable";
/// Sub-condition tracking the server deployment
pub const REKOR_SERVER_CONDITION: &str = "ServerAvailable";

/// Rekor Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: rhtas.redhat.com/v1alpha1
/// kind: Rekor
/// metadata:
///   name: rekor
/// spec:
///   signer:
///     keyRef:
///       name: rekor-signer
///       key: private
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Rekor",
    group = "rhtas.redhat.com",
    version = "v1alpha1",
    namespaced,
    status = "RekorStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RekorSpec {
    /// Existing Trillian tree to use; a new tree is created when unset
    #[serde(default, rename = "treeID")]
    pub tree_id: Option<i64>,
    /// Signer configuration
    #[serde(default)]
    pub signer: RekorSigner,
    /// Attestation storage volume
    #[serde(default)]
    pub pvc: Pvc,
}

/// Signer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RekorSigner {
    /// Private key used to sign log entries; generated when unset
    #[serde(default)]
    pub key_ref: Option<SecretKeySelector>,
}

/// Status of the Rekor resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RekorStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Automatic recoveries since the last time the resource was Ready
    #[serde(default)]
    pub restarts: u32,
    /// Trillian tree in use
    #[serde(default, rename = "treeID")]
    pub tree_id: Option<i64>,
    /// Signer in use
    #[serde(default)]
    pub signer: Option<RekorSigner>,
    /// Attestation storage claim
    #[serde(default)]
    pub pvc_name: Option<String>,
    /// Internal address of the server
    #[serde(default)]
    pub url: Option<String>,
}

impl Rekor {
    pub fn status_mut(&mut self) -> &mut RekorStatus {
        self.status.get_or_insert_with(RekorStatus::default)
    }

    pub fn signer_key_ref(&self) -> Option<&SecretKeySelector> {
        self.status
            .as_ref()
            .and_then(|s| s.signer.as_ref())
            .and_then(|s| s.key_ref.as_ref())
    }

    pub fn pvc_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.pvc_name.as_deref())
    }
}

impl ConditionsAware for Rekor {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.status_mut().conditions, condition);
    }
}

impl ManagedResource for Rekor {
    const COMPONENT: &'static str = "rekor";

    fn restarts(&self) -> u32 {
        self.status.as_ref().map_or(0, |s| s.restarts)
    }

    fn set_restarts(&mut self, restarts: u32) {
        self.status_mut().restarts = restarts;
    }

    fn reset_status_for_recovery(&mut self) {
        let previous = self.status.take().unwrap_or_default();
        let mut fresh = RekorStatus {
            restarts: previous.restarts,
            tree_id: previous.tree_id,
            pvc_name: previous.pvc_name,
            ..RekorStatus::default()
        };

        if let Some(signer) =
            find_condition(&previous.conditions, REKOR_SIGNER_CONDITION).filter(|c| c.is_true())
        {
            fresh.signer = previous.signer;
            fresh.conditions.push(signer.clone());
        }

        self.status = Some(fresh);
    }
}

impl TreeIdentified for Rekor {
    fn spec_tree_id(&self) -> Option<i64> {
        self.spec.tree_id
    }

    fn status_tree_id(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.tree_id)
    }

    fn set_status_tree_id(&mut self, tree_id: i64) {
        self.status_mut().tree_id = Some(tree_id);
    }
}
