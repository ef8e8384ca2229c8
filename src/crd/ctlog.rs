//! # CTlog
//!
//! Certificate transparency log front-end backed by a Trillian tree.

use super::{
    set_condition, Condition, ConditionsAware, LocalObjectReference, ManagedResource,
    SecretKeySelector, TreeIdentified,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sub-condition tracking the Fulcio root certificate lookup
pub const CTLOG_CERT_CONDITION: &str = "FulcioCertAvailable";
/// Sub-condition tracking the log key pair
pub const CTLOG_KEYS_CONDITION: &str = "KeysAvailable";
/// Sub-condition tracking the generated server configuration
pub const CTLOG_SERVER_CONFIG_CONDITION: &str = "ServerConfigAvailable";
/// Sub-condition tracking the server deployment
pub const CTLOG_SERVER_CONDITION: &str = "ServerAvailable";

/// CTlog Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: rhtas.redhat.com/v1alpha1
/// kind: CTlog
/// metadata:
///   name: ctlog
/// spec:
///   treeID: 1234567890
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "CTlog",
    group = "rhtas.redhat.com",
    version = "v1alpha1",
    namespaced,
    status = "CTlogStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CTlogSpec {
    /// Existing Trillian tree to use; a new tree is created when unset
    #[serde(default, rename = "treeID")]
    pub tree_id: Option<i64>,
    /// Private key of the log; generated when unset
    #[serde(default)]
    pub private_key_ref: Option<SecretKeySelector>,
    /// Public key of the log; required together with `privateKeyRef`
    #[serde(default)]
    pub public_key_ref: Option<SecretKeySelector>,
    /// Root certificates accepted by the log; discovered from the Fulcio
    /// CA Secret when empty
    #[serde(default)]
    pub root_certificates: Vec<SecretKeySelector>,
}

/// Status of the CTlog resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CTlogStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Automatic recoveries since the last time the resource was Ready
    #[serde(default)]
    pub restarts: u32,
    /// Trillian tree in use
    #[serde(default, rename = "treeID")]
    pub tree_id: Option<i64>,
    #[serde(default)]
    pub private_key_ref: Option<SecretKeySelector>,
    #[serde(default)]
    pub public_key_ref: Option<SecretKeySelector>,
    #[serde(default)]
    pub root_certificates: Vec<SecretKeySelector>,
    /// Secret holding the rendered server configuration
    #[serde(default)]
    pub server_config_ref: Option<LocalObjectReference>,
}

impl CTlog {
    pub fn status_ref(&self) -> Option<&CTlogStatus> {
        self.status.as_ref()
    }

    pub fn status_mut(&mut self) -> &mut CTlogStatus {
        self.status.get_or_insert_with(CTlogStatus::default)
    }
}

impl ConditionsAware for CTlog {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.status_mut().conditions, condition);
    }
}

impl ManagedResource for CTlog {
    const COMPONENT: &'static str = "ctlog";

    fn restarts(&self) -> u32 {
        self.status.as_ref().map_or(0, |s| s.restarts)
    }

    fn set_restarts(&mut self, restarts: u32) {
        self.status_mut().restarts = restarts;
    }

    fn reset_status_for_recovery(&mut self) {
        let previous = self.status.take().unwrap_or_default();
        let mut fresh = CTlogStatus {
            restarts: previous.restarts,
            tree_id: previous.tree_id,
            ..CTlogStatus::default()
        };

        if let Some(keys) = super::find_condition(&previous.conditions, CTLOG_KEYS_CONDITION)
            .filter(|c| c.is_true())
        {
            fresh.private_key_ref = previous.private_key_ref;
            fresh.public_key_ref = previous.public_key_ref;
            fresh.conditions.push(keys.clone());
        }

        if let Some(config) =
            super::find_condition(&previous.conditions, CTLOG_SERVER_CONFIG_CONDITION)
                .filter(|c| c.is_true())
        {
            fresh.server_config_ref = previous.server_config_ref;
            fresh.conditions.push(config.clone());
        }

        self.status = Some(fresh);
    }
}

impl TreeIdentified for CTlog {
    fn spec_tree_id(&self) -> Option<i64> {
        self.spec.tree_id
    }

    fn status_tree_id(&self) -> Option<i64> {
        self.status.as_ref().and_then(|s| s.tree_id)
    }

    fn set_status_tree_id(&mut self, tree_id: i64) {
        let status = self.status_mut();
        if status.tree_id != Some(tree_id) {
            // the rendered configuration embeds the tree id
            status.server_config_ref = None;
            status
                .conditions
                .retain(|c| c.r#type != CTLOG_SERVER_CONFIG_CONDITION);
        }
        status.tree_id = Some(tree_id);
    }
}
