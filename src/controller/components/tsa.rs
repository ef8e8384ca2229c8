//! # Timestamp Authority
//!
//! RFC 3161 timestamping server.
//!
//! The server signs with a file-based key issued under a certificate chain.
//! Both come from the spec or are generated once into a Secret owned by the
//! resource; the generated chain is published under the
//! `rhtas.redhat.com/tsa.certchain.pem` trust label so the TUF repository
//! picks it up.

use super::{child_labels, child_selector, creating_or_ready, secret_volume};
use crate::constants::TSA_SERVER_IMAGE;
use crate::controller::action::{
    error_or_failed, failed, in_phase, Action, ActionContext, ActionError, AwaitDeployment,
    Directive, EnsureChild, Pipeline, ToCreating, ToInitialize, ToPending, ToReady,
};
use crate::controller::client::{create_typed, get_opt};
use crate::controller::events::reasons;
use crate::controller::keys::{generate_timestamping_chain, Subject};
use crate::controller::kubernetes::{container, deployment, secret, secret_env, service, trust_label};
use crate::crd::{
    name_of, namespace_of, Condition, ConditionStatus, ConditionsAware, LocalObjectReference,
    NtpConfig, Phase, SecretKeySelector, TimestampAuthority, TsaSigner, TSA_SERVER_CONDITION,
    TSA_SERVER_CONFIG_CONDITION, TSA_SIGNER_CONDITION,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{KeyToPath, PodSpec, Secret, Service, Volume, VolumeMount};
use kube::runtime::events::EventType;
use kube::Resource;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

pub const DEPLOYMENT_NAME: &str = "tsa-server";
/// Trust file the generated chain is published as
pub const CHAIN_FILE: &str = "tsa.certchain.pem";
const SERVER_PORT: i32 = 3000;
const SIGNER_KEY: &str = "private";
const CHAIN_KEY: &str = "certificateChain";
const NTP_CONFIG_KEY: &str = "ntpsync.yaml";

pub fn signer_secret_name(instance: &TimestampAuthority) -> String {
    format!("tsa-signer-{}", name_of(instance))
}

pub fn config_secret_name(instance: &TimestampAuthority) -> String {
    format!("tsa-server-config-{}", name_of(instance))
}

/// In-cluster URL of the timestamping API
pub fn server_url(namespace: &str) -> String {
    format!("http://{DEPLOYMENT_NAME}.{namespace}.svc")
}

/// Signer material named by the spec, `None` when it is left to the operator
fn spec_signer(instance: &TimestampAuthority) -> Result<Option<TsaSigner>, ActionError> {
    let signer = &instance.spec.signer;
    match (signer.chain_ref(), signer.private_key_ref()) {
        (Some(chain), Some(key)) => Ok(Some(TsaSigner::resolved(
            chain.clone(),
            key.clone(),
            signer.password_ref().cloned(),
        ))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(ActionError::failed(
            "certificateChain.certificateChainRef requires fileSigner.privateKeyRef",
        )),
        (None, Some(_)) => Err(ActionError::failed(
            "fileSigner.privateKeyRef requires certificateChain.certificateChainRef",
        )),
    }
}

fn generated_signer(instance: &TimestampAuthority) -> TsaSigner {
    let name = signer_secret_name(instance);
    TsaSigner::resolved(
        SecretKeySelector::new(&name, CHAIN_KEY),
        SecretKeySelector::new(&name, SIGNER_KEY),
        None,
    )
}

/// Whether the signer in use differs from the one the spec asks for
fn signer_changed(instance: &TimestampAuthority) -> bool {
    let wanted = match spec_signer(instance) {
        Ok(Some(signer)) => signer,
        Ok(None) => generated_signer(instance),
        Err(_) => return false,
    };
    instance.status_signer() != Some(&wanted)
}

/// Resolves the signing key and its certificate chain
///
/// Like the Rekor signer, a signer changed on a running server is picked up
/// in `Creating` and `Ready` and rolled out by the deployment ensure step.
#[derive(Debug, Default)]
pub struct ResolveSigner;

#[async_trait]
impl Action<TimestampAuthority> for ResolveSigner {
    fn name(&self) -> &str {
        "resolve signer"
    }

    fn can_handle(&self, instance: &TimestampAuthority) -> bool {
        in_phase(instance, &[Phase::Pending, Phase::Creating, Phase::Ready])
            && (!instance.is_condition_true(TSA_SIGNER_CONDITION) || signer_changed(instance))
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut TimestampAuthority) -> Directive {
        let signer = match spec_signer(instance) {
            Ok(Some(signer)) => signer,
            Ok(None) => match ensure_signer_secret(ctx, instance).await {
                Ok(signer) => signer,
                Err(e) => return error_or_failed(instance, e),
            },
            Err(e) => return failed(instance, e),
        };

        let message = match instance.status_signer() {
            Some(previous) if previous != &signer => {
                info!("Timestamp signer changed");
                let target = signer.chain_ref().map_or_else(String::new, |r| r.name.clone());
                ctx.event(
                    instance,
                    EventType::Normal,
                    reasons::SIGNER_CHANGED,
                    format!("Signer changed to {target}"),
                )
                .await;
                "Signer changed"
            }
            _ => "Signer resolved",
        };

        instance.status_mut().signer = Some(signer);
        instance.set_condition(
            Condition::new(TSA_SIGNER_CONDITION, ConditionStatus::True, Phase::Ready)
                .with_message(message),
        );
        Directive::StatusUpdate
    }
}

fn subject(common_name: Option<&String>, organization: Option<&String>, fallback: String) -> Subject {
    Subject::new(common_name.cloned().unwrap_or(fallback), organization.cloned())
}

async fn ensure_signer_secret(
    ctx: &ActionContext,
    instance: &TimestampAuthority,
) -> Result<TsaSigner, ActionError> {
    let namespace = namespace_of(instance);
    let name = signer_secret_name(instance);
    let signer = generated_signer(instance);

    if get_opt::<Secret>(ctx.client(), &namespace, &name).await?.is_some() {
        return Ok(signer);
    }

    let chain = &instance.spec.signer.certificate_chain;
    let instance_name = name_of(instance);
    let root = subject(
        chain.root_ca.common_name.as_ref(),
        chain.root_ca.organization_name.as_ref(),
        format!("{instance_name} root"),
    );
    let intermediate = subject(
        chain.intermediate_ca.common_name.as_ref(),
        chain
            .intermediate_ca
            .organization_name
            .as_ref()
            .or(chain.root_ca.organization_name.as_ref()),
        format!("{instance_name} intermediate"),
    );
    let leaf = Subject::new(format!("{instance_name} signer"), intermediate.organization.clone());
    let generated = generate_timestamping_chain(&root, &intermediate, &leaf)?;

    let mut desired = secret(
        &name,
        &namespace,
        &child_labels(instance, "signer"),
        BTreeMap::from([
            (SIGNER_KEY.to_string(), generated.private_pem.into_bytes()),
            (CHAIN_KEY.to_string(), generated.chain_pem.into_bytes()),
        ]),
    );
    desired
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(trust_label(CHAIN_FILE), CHAIN_KEY.to_string());
    if let Some(owner) = instance.controller_owner_ref(&()) {
        desired.metadata.owner_references = Some(vec![owner]);
    }
    create_typed(ctx.client(), &namespace, &desired).await?;
    info!(secret = %name, "Generated timestamp signer and certificate chain");
    Ok(signer)
}

/// On-disk form of the server's NTP monitor settings
#[derive(Debug, Serialize)]
struct NtpSyncFile<'a> {
    request_attempts: u32,
    request_timeout: u32,
    num_servers: u32,
    server_threshold: u32,
    max_time_delta: u32,
    period: u32,
    servers: &'a [String],
}

/// Render the NTP monitor configuration read by the server
pub fn render_ntp_config(config: &NtpConfig) -> Result<String, ActionError> {
    let file = NtpSyncFile {
        request_attempts: config.request_attempts,
        request_timeout: config.request_timeout,
        num_servers: config.num_servers,
        server_threshold: config.server_threshold,
        max_time_delta: config.max_time_delta,
        period: config.period,
        servers: &config.servers,
    };
    serde_yaml::to_string(&file).map_err(|e| ActionError::failed(format!("invalid NTP config: {e}")))
}

fn build_server_config(instance: &TimestampAuthority) -> Result<Option<Secret>, ActionError> {
    let config = render_ntp_config(&instance.spec.ntp_monitoring.config)?;
    Ok(Some(secret(
        &config_secret_name(instance),
        &namespace_of(instance),
        &child_labels(instance, "server-config"),
        BTreeMap::from([(NTP_CONFIG_KEY.to_string(), config.into_bytes())]),
    )))
}

fn record_server_config(instance: &mut TimestampAuthority, config: &Secret) -> bool {
    let name = config.metadata.name.clone().unwrap_or_default();
    let recorded = instance.is_condition_true(TSA_SERVER_CONFIG_CONDITION)
        && instance.server_config_ref().is_some_and(|r| r.name == name);
    if recorded {
        return false;
    }
    instance.status_mut().server_config_ref = Some(LocalObjectReference { name });
    instance.set_condition(
        Condition::new(TSA_SERVER_CONFIG_CONDITION, ConditionStatus::True, Phase::Ready)
            .with_message("Server config created"),
    );
    true
}

/// Volume exposing a single Secret key as `file` under `mount_path`
fn secret_file(volume: &str, source: &SecretKeySelector, mount_path: &str, file: &str) -> (Volume, VolumeMount) {
    let (mut volume, mount) = secret_volume(volume, &source.name, mount_path);
    if let Some(secret) = volume.secret.as_mut() {
        secret.items = Some(vec![KeyToPath {
            key: source.key.clone(),
            path: file.to_string(),
            mode: None,
        }]);
    }
    (volume, mount)
}

fn build_deployment(instance: &TimestampAuthority) -> Result<Option<Deployment>, ActionError> {
    let (Some(signer), Some(config_ref)) = (instance.status_signer(), instance.server_config_ref()) else {
        return Ok(None);
    };
    let (Some(chain), Some(key)) = (signer.chain_ref(), signer.private_key_ref()) else {
        return Ok(None);
    };

    let (key_volume, key_mount) = secret_file("signer", key, "/var/run/timestamp-signer/key", "signer.pem");
    let (chain_volume, chain_mount) =
        secret_file("chain", chain, "/var/run/timestamp-signer/chain", "chain.pem");
    let (config_volume, config_mount) = secret_volume("config", &config_ref.name, "/var/run/tsa-config");

    let mut args = vec![
        "serve".to_string(),
        "--host=0.0.0.0".to_string(),
        format!("--port={SERVER_PORT}"),
        "--timestamp-signer=file".to_string(),
        "--file-signer-key-path=/var/run/timestamp-signer/key/signer.pem".to_string(),
        "--certificate-chain-path=/var/run/timestamp-signer/chain/chain.pem".to_string(),
    ];
    if instance.spec.ntp_monitoring.enabled {
        args.push(format!("--ntp-monitoring=/var/run/tsa-config/{NTP_CONFIG_KEY}"));
    } else {
        args.push("--disable-ntp-monitoring".to_string());
    }

    let mut server = container(DEPLOYMENT_NAME, TSA_SERVER_IMAGE, args, &[("http", SERVER_PORT)]);
    if let Some(password) = signer.password_ref() {
        server.env = Some(vec![secret_env("SIGNER_PASSWORD", &password.name, &password.key)]);
        if let Some(args) = server.args.as_mut() {
            args.push("--file-signer-passwd=$(SIGNER_PASSWORD)".to_string());
        }
    }
    server.volume_mounts = Some(vec![key_mount, chain_mount, config_mount]);

    Ok(Some(deployment(
        DEPLOYMENT_NAME,
        &namespace_of(instance),
        &child_labels(instance, DEPLOYMENT_NAME),
        &child_selector(instance, DEPLOYMENT_NAME),
        PodSpec {
            containers: vec![server],
            volumes: Some(vec![key_volume, chain_volume, config_volume]),
            ..PodSpec::default()
        },
    )))
}

fn build_service(instance: &TimestampAuthority) -> Result<Option<Service>, ActionError> {
    Ok(Some(service(
        DEPLOYMENT_NAME,
        &namespace_of(instance),
        &child_labels(instance, DEPLOYMENT_NAME),
        &child_selector(instance, DEPLOYMENT_NAME),
        &[("http", SERVER_PORT)],
    )))
}

fn publish_url(instance: &mut TimestampAuthority) {
    let url = server_url(&namespace_of(instance));
    instance.status_mut().url = Some(url);
}

/// TimestampAuthority pipeline
pub fn pipeline() -> Pipeline<TimestampAuthority> {
    Pipeline::new()
        .then(ToPending::new())
        .then(ResolveSigner)
        .then(ToCreating::new())
        .then(
            EnsureChild::new(
                "ensure tsa server config",
                creating_or_ready::<TimestampAuthority>,
                build_server_config,
            )
            .recording(record_server_config),
        )
        .then(EnsureChild::new(
            "ensure tsa deployment",
            creating_or_ready::<TimestampAuthority>,
            build_deployment,
        ))
        .then(EnsureChild::new(
            "ensure tsa service",
            creating_or_ready::<TimestampAuthority>,
            build_service,
        ))
        .then(ToInitialize::new())
        .then(AwaitDeployment::new(DEPLOYMENT_NAME, TSA_SERVER_CONDITION).on_ready(publish_url))
        .then(ToReady::new())
}
