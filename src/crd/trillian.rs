//! # Trillian
//!
//! Log backend: a database, a log server and a log signer.

use super::{
    default_true, set_condition, Condition, ConditionsAware, LocalObjectReference,
    ManagedResource, Pvc,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sub-condition tracking the database deployment
pub const DB_CONDITION: &str = "DbAvailable";
/// Sub-condition tracking the log server deployment
pub const TRILLIAN_SERVER_CONDITION: &str = "ServerAvailable";
/// Sub-condition tracking the log signer deployment
pub const TRILLIAN_SIGNER_CONDITION: &str = "SignerAvailable";

/// Trillian Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: rhtas.redhat.com/v1alpha1
/// kind: Trillian
/// metadata:
///   name: trillian
/// spec:
///   database:
///     create: true
///     pvc:
///       size: 5Gi
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Trillian",
    group = "rhtas.redhat.com",
    version = "v1alpha1",
    namespaced,
    status = "TrillianStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrillianSpec {
    /// Database configuration
    #[serde(default)]
    pub database: TrillianDb,
}

/// Trillian database configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrillianDb {
    /// Deploy a database; when false `databaseSecretRef` must point at an
    /// existing database's credentials
    #[serde(default = "default_true")]
    pub create: bool,
    /// Secret with `mysql-host`, `mysql-port`, `mysql-user`, `mysql-password`
    /// and `mysql-database`
    #[serde(default)]
    pub database_secret_ref: Option<LocalObjectReference>,
    /// Database volume settings
    #[serde(default)]
    pub pvc: Pvc,
}

impl Default for TrillianDb {
    fn default() -> Self {
        Self {
            create: true,
            database_secret_ref: None,
            pvc: Pvc::default(),
        }
    }
}

/// Status of the Trillian resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrillianStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Automatic recoveries since the last time the resource was Ready
    #[serde(default)]
    pub restarts: u32,
    /// Database references in use
    #[serde(default)]
    pub database: Option<TrillianDbStatus>,
    /// Internal address of the log server gRPC endpoint
    #[serde(default)]
    pub url: Option<String>,
}

/// Database references in use
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrillianDbStatus {
    #[serde(default)]
    pub database_secret_ref: Option<LocalObjectReference>,
    #[serde(default)]
    pub pvc_name: Option<String>,
}

impl Trillian {
    pub fn database_status(&self) -> Option<&TrillianDbStatus> {
        self.status.as_ref().and_then(|s| s.database.as_ref())
    }

    pub fn database_status_mut(&mut self) -> &mut TrillianDbStatus {
        self.status
            .get_or_insert_with(TrillianStatus::default)
            .database
            .get_or_insert_with(TrillianDbStatus::default)
    }
}

impl ConditionsAware for Trillian {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn set_condition(&mut self, condition: Condition) {
        let status = self.status.get_or_insert_with(TrillianStatus::default);
        set_condition(&mut status.conditions, condition);
    }
}

impl ManagedResource for Trillian {
    const COMPONENT: &'static str = "trillian";

    fn restarts(&self) -> u32 {
        self.status.as_ref().map_or(0, |s| s.restarts)
    }

    fn set_restarts(&mut self, restarts: u32) {
        self.status.get_or_insert_with(TrillianStatus::default).restarts = restarts;
    }

    fn reset_status_for_recovery(&mut self) {
        let previous = self.status.take().unwrap_or_default();
        // credentials and the volume survive; deployments are re-verified
        self.status = Some(TrillianStatus {
            restarts: previous.restarts,
            database: previous.database,
            ..TrillianStatus::default()
        });
    }
}
