//! # Rekor
//!
//! Transparency log server backed by a Trillian tree.

use super::{child_labels, child_selector, creating_or_ready, pvc_volume, secret_volume};
use crate::config::ControllerConfig;
use crate::constants::{REKOR_SERVER_IMAGE, TRILLIAN_GRPC_PORT, TRILLIAN_LOGSERVER_NAME};
use crate::controller::action::{
    error_or_failed, in_phase, Action, ActionContext, ActionError, AwaitDeployment, Directive,
    EnsureChild, Pipeline, ResolveTree, ToCreating, ToInitialize, ToPending, ToReady,
};
use crate::controller::events::reasons;
use crate::controller::client::{create_typed, get_opt};
use crate::controller::keys::generate_key_pair;
use crate::controller::kubernetes::{container, deployment, persistent_volume_claim, secret, service};
use crate::controller::tree::TreeService;
use crate::crd::{
    name_of, namespace_of, Condition, ConditionStatus, ConditionsAware, Phase, Rekor, RekorSigner,
    SecretKeySelector, TreeIdentified, REKOR_SERVER_CONDITION, REKOR_SIGNER_CONDITION,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodSpec, Secret, Service};
use kube::runtime::events::EventType;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const DEPLOYMENT_NAME: &str = "rekor-server";
pub const COMPONENT_NAME: &str = "rekor-server";
const SERVER_PORT: i32 = 3000;
const SIGNER_KEY: &str = "private";

pub fn signer_secret_name(instance: &Rekor) -> String {
    format!("rekor-signer-{}", name_of(instance))
}

pub fn pvc_name(instance: &Rekor) -> String {
    format!("rekor-{}-pvc", name_of(instance))
}

/// In-cluster URL of the Rekor API
pub fn server_url(namespace: &str) -> String {
    format!("http://{DEPLOYMENT_NAME}.{namespace}.svc")
}

/// Whether the signer in use differs from the one the spec asks for
///
/// Without a `keyRef` the generated `rekor-signer-<name>` key is expected.
fn signer_changed(instance: &Rekor) -> bool {
    match (instance.spec.signer.key_ref.as_ref(), instance.signer_key_ref()) {
        (Some(wanted), current) => current != Some(wanted),
        (None, Some(current)) => current.name != signer_secret_name(instance),
        (None, None) => false,
    }
}

/// Resolves the signing key
///
/// A key referenced in the spec is used as-is. Otherwise a key pair is
/// generated once into a Secret owned by the resource and reused afterwards.
/// A `keyRef` changed on a running log is picked up in `Creating` and
/// `Ready`; the deployment is then rolled by its ensure step.
#[derive(Debug, Default)]
pub struct ResolveSigner;

#[async_trait]
impl Action<Rekor> for ResolveSigner {
    fn name(&self) -> &str {
        "resolve signer"
    }

    fn can_handle(&self, instance: &Rekor) -> bool {
        in_phase(instance, &[Phase::Pending, Phase::Creating, Phase::Ready])
            && (!instance.is_condition_true(REKOR_SIGNER_CONDITION) || signer_changed(instance))
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut Rekor) -> Directive {
        let key_ref = match instance.spec.signer.key_ref.clone() {
            Some(key_ref) => key_ref,
            None => match ensure_signer_secret(ctx, instance).await {
                Ok(key_ref) => key_ref,
                Err(e) => return error_or_failed(instance, e),
            },
        };

        let previous = instance.signer_key_ref().cloned();
        let message = match previous {
            Some(previous) if previous != key_ref => {
                info!(from = %previous.name, to = %key_ref.name, "Rekor signer changed");
                ctx.event(
                    instance,
                    EventType::Normal,
                    reasons::SIGNER_CHANGED,
                    format!("Signer changed to {}/{}", key_ref.name, key_ref.key),
                )
                .await;
                "Signer changed"
            }
            _ => "Signer resolved",
        };

        instance.status_mut().signer = Some(RekorSigner {
            key_ref: Some(key_ref),
        });
        instance.set_condition(
            Condition::new(REKOR_SIGNER_CONDITION, ConditionStatus::True, Phase::Ready)
                .with_message(message),
        );
        Directive::StatusUpdate
    }
}

async fn ensure_signer_secret(
    ctx: &ActionContext,
    instance: &Rekor,
) -> Result<SecretKeySelector, ActionError> {
    let namespace = namespace_of(instance);
    let name = signer_secret_name(instance);
    let selector = SecretKeySelector::new(&name, SIGNER_KEY);

    if get_opt::<Secret>(ctx.client(), &namespace, &name).await?.is_some() {
        return Ok(selector);
    }

    let pair = generate_key_pair()?;
    let mut desired = secret(
        &name,
        &namespace,
        &child_labels(instance, "signer"),
        BTreeMap::from([
            (SIGNER_KEY.to_string(), pair.private_pem.into_bytes()),
            ("public".to_string(), pair.public_pem.into_bytes()),
        ]),
    );
    if let Some(owner) = instance.controller_owner_ref(&()) {
        desired.metadata.owner_references = Some(vec![owner]);
    }
    create_typed(ctx.client(), &namespace, &desired).await?;
    info!(secret = %name, "Generated Rekor signer key");
    Ok(selector)
}

fn build_pvc(instance: &Rekor) -> Result<Option<PersistentVolumeClaim>, ActionError> {
    Ok(Some(persistent_volume_claim(
        &pvc_name(instance),
        &namespace_of(instance),
        &child_labels(instance, COMPONENT_NAME),
        &instance.spec.pvc,
    )))
}

fn record_pvc(instance: &mut Rekor, pvc: &PersistentVolumeClaim) -> bool {
    let name = pvc.metadata.name.clone();
    let status = instance.status_mut();
    if status.pvc_name == name {
        return false;
    }
    status.pvc_name = name;
    true
}

fn build_deployment(instance: &Rekor) -> Result<Option<Deployment>, ActionError> {
    let (Some(tree_id), Some(key_ref)) = (instance.status_tree_id(), instance.signer_key_ref()) else {
        return Ok(None);
    };
    let namespace = namespace_of(instance);
    let claim = instance.pvc_name().map_or_else(|| pvc_name(instance), str::to_string);
    let (key_volume, key_mount) = secret_volume("rekor-signer", &key_ref.name, "/key");
    let (data_volume, data_mount) = pvc_volume("storage", &claim, "/var/run/attestations");

    let mut server = container(
        COMPONENT_NAME,
        REKOR_SERVER_IMAGE,
        vec![
            "serve".to_string(),
            format!("--trillian_log_server.address={TRILLIAN_LOGSERVER_NAME}.{namespace}.svc"),
            format!("--trillian_log_server.port={TRILLIAN_GRPC_PORT}"),
            format!("--trillian_log_server.tlog_id={tree_id}"),
            "--rekor_server.address=0.0.0.0".to_string(),
            format!("--port={SERVER_PORT}"),
            format!("--rekor_server.signer=/key/{}", key_ref.key),
            "--attestation_storage_bucket=file:///var/run/attestations".to_string(),
        ],
        &[("http", SERVER_PORT)],
    );
    server.volume_mounts = Some(vec![key_mount, data_mount]);

    Ok(Some(deployment(
        DEPLOYMENT_NAME,
        &namespace,
        &child_labels(instance, COMPONENT_NAME),
        &child_selector(instance, COMPONENT_NAME),
        PodSpec {
            containers: vec![server],
            volumes: Some(vec![key_volume, data_volume]),
            ..PodSpec::default()
        },
    )))
}

fn build_service(instance: &Rekor) -> Result<Option<Service>, ActionError> {
    Ok(Some(service(
        DEPLOYMENT_NAME,
        &namespace_of(instance),
        &child_labels(instance, COMPONENT_NAME),
        &child_selector(instance, COMPONENT_NAME),
        &[("http", SERVER_PORT)],
    )))
}

fn publish_url(instance: &mut Rekor) {
    let url = server_url(&namespace_of(instance));
    instance.status_mut().url = Some(url);
}

/// Rekor pipeline
pub fn pipeline(trees: Arc<dyn TreeService>, config: &ControllerConfig) -> Pipeline<Rekor> {
    Pipeline::new()
        .then(ToPending::new())
        .then(ResolveSigner)
        .then(ToCreating::new())
        .then(
            EnsureChild::new("ensure rekor pvc", creating_or_ready::<Rekor>, build_pvc)
                .recording(record_pvc),
        )
        .then(ResolveTree::new(trees, config.tree_create_timeout()))
        .then(EnsureChild::new(
            "ensure rekor deployment",
            creating_or_ready::<Rekor>,
            build_deployment,
        ))
        .then(EnsureChild::new(
            "ensure rekor service",
            creating_or_ready::<Rekor>,
            build_service,
        ))
        .then(ToInitialize::new())
        .then(AwaitDeployment::new(DEPLOYMENT_NAME, REKOR_SERVER_CONDITION).on_ready(publish_url))
        .then(ToReady::new())
}
