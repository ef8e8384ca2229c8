//! # TimestampAuthority
//!
//! RFC 3161 timestamping server signing with a file-based key and
//! certificate chain.

use super::{
    default_true, find_condition, set_condition, Condition, ConditionsAware, LocalObjectReference,
    ManagedResource, SecretKeySelector,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sub-condition tracking the signer key and certificate chain
pub const TSA_SIGNER_CONDITION: &str = "SignerAvailable";
/// Sub-condition tracking the server configuration
pub const TSA_SERVER_CONFIG_CONDITION: &str = "ServerConfigAvailable";
/// Sub-condition tracking the server deployment
pub const TSA_SERVER_CONDITION: &str = "ServerAvailable";

/// TimestampAuthority Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: rhtas.redhat.com/v1alpha1
/// kind: TimestampAuthority
/// metadata:
///   name: tsa
/// spec:
///   signer:
///     certificateChain:
///       rootCA:
///         commonName: tsa.example.com
///         organizationName: Example
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "TimestampAuthority",
    group = "rhtas.redhat.com",
    version = "v1alpha1",
    namespaced,
    shortname = "tsa",
    status = "TimestampAuthorityStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TimestampAuthoritySpec {
    /// Signer configuration
    #[serde(default)]
    pub signer: TsaSigner,
    /// Clock drift monitoring against public NTP servers
    #[serde(default)]
    pub ntp_monitoring: NtpMonitoring,
}

/// Signing key and the certificate chain vouching for it
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TsaSigner {
    #[serde(default)]
    pub certificate_chain: CertificateChain,
    /// File-based signer; generated together with the chain when unset
    #[serde(default)]
    pub file_signer: Option<FileSigner>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateChain {
    /// PEM chain, leaf first; requires `fileSigner.privateKeyRef`
    #[serde(default)]
    pub certificate_chain_ref: Option<SecretKeySelector>,
    /// Subject of the generated root CA
    #[serde(default, rename = "rootCA")]
    pub root_ca: TsaCertificateAuthority,
    /// Subject of the generated intermediate CA
    #[serde(default, rename = "intermediateCA")]
    pub intermediate_ca: TsaCertificateAuthority,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TsaCertificateAuthority {
    /// Defaults to a name derived from the resource
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub organization_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSigner {
    /// PEM private key matching the leaf of the chain
    #[serde(default)]
    pub private_key_ref: Option<SecretKeySelector>,
    /// Password of an encrypted private key
    #[serde(default)]
    pub password_ref: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NtpMonitoring {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: NtpConfig,
}

impl Default for NtpMonitoring {
    fn default() -> Self {
        Self {
            enabled: true,
            config: NtpConfig::default(),
        }
    }
}

/// Settings of the server's NTP drift monitor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct NtpConfig {
    /// Attempts per server before it counts as failed
    pub request_attempts: u32,
    /// Per-request timeout (seconds)
    pub request_timeout: u32,
    /// Servers sampled on each check
    pub num_servers: u32,
    /// Servers that must agree for a check to pass
    pub server_threshold: u32,
    /// Tolerated drift (seconds)
    pub max_time_delta: u32,
    /// Interval between checks (seconds)
    pub period: u32,
    pub servers: Vec<String>,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            request_attempts: 3,
            request_timeout: 5,
            num_servers: 4,
            server_threshold: 3,
            max_time_delta: 6,
            period: 60,
            servers: [
                "time.apple.com",
                "time.google.com",
                "time-a-b.nist.gov",
                "time-b-b.nist.gov",
                "gbg1.ntp.se",
                "ntp.ubuntu.com",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

/// Status of the TimestampAuthority resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimestampAuthorityStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Automatic recoveries since the last time the resource was Ready
    #[serde(default)]
    pub restarts: u32,
    /// Signer in use
    #[serde(default)]
    pub signer: Option<TsaSigner>,
    /// Rendered server configuration
    #[serde(default)]
    pub server_config_ref: Option<LocalObjectReference>,
    /// Internal address of the server
    #[serde(default)]
    pub url: Option<String>,
}

impl TsaSigner {
    /// A signer holding only references to resolved material
    pub fn resolved(
        chain: SecretKeySelector,
        private_key: SecretKeySelector,
        password: Option<SecretKeySelector>,
    ) -> Self {
        Self {
            certificate_chain: CertificateChain {
                certificate_chain_ref: Some(chain),
                ..CertificateChain::default()
            },
            file_signer: Some(FileSigner {
                private_key_ref: Some(private_key),
                password_ref: password,
            }),
        }
    }

    pub fn chain_ref(&self) -> Option<&SecretKeySelector> {
        self.certificate_chain.certificate_chain_ref.as_ref()
    }

    pub fn private_key_ref(&self) -> Option<&SecretKeySelector> {
        self.file_signer.as_ref().and_then(|f| f.private_key_ref.as_ref())
    }

    pub fn password_ref(&self) -> Option<&SecretKeySelector> {
        self.file_signer.as_ref().and_then(|f| f.password_ref.as_ref())
    }
}

impl TimestampAuthority {
    pub fn status_mut(&mut self) -> &mut TimestampAuthorityStatus {
        self.status.get_or_insert_with(TimestampAuthorityStatus::default)
    }

    pub fn status_signer(&self) -> Option<&TsaSigner> {
        self.status.as_ref().and_then(|s| s.signer.as_ref())
    }

    pub fn server_config_ref(&self) -> Option<&LocalObjectReference> {
        self.status.as_ref().and_then(|s| s.server_config_ref.as_ref())
    }
}

impl ConditionsAware for TimestampAuthority {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map_or(&[], |s| s.conditions.as_slice())
    }

    fn set_condition(&mut self, condition: Condition) {
        set_condition(&mut self.status_mut().conditions, condition);
    }
}

impl ManagedResource for TimestampAuthority {
    const COMPONENT: &'static str = "timestamp-authority";

    fn restarts(&self) -> u32 {
        self.status.as_ref().map_or(0, |s| s.restarts)
    }

    fn set_restarts(&mut self, restarts: u32) {
        self.status_mut().restarts = restarts;
    }

    fn reset_status_for_recovery(&mut self) {
        let previous = self.status.take().unwrap_or_default();
        let mut fresh = TimestampAuthorityStatus {
            restarts: previous.restarts,
            ..TimestampAuthorityStatus::default()
        };

        // a generated chain cannot be reproduced, keep pointing at it
        if let Some(signer) =
            find_condition(&previous.conditions, TSA_SIGNER_CONDITION).filter(|c| c.is_true())
        {
            fresh.signer = previous.signer;
            fresh.conditions.push(signer.clone());
        }

        self.status = Some(fresh);
    }
}
