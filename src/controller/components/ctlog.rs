//! # CTlog
//!
//! Certificate transparency log front-end.
//!
//! The log needs three things before its server can start: the Fulcio root
//! certificates it accepts, its own key pair and a Trillian tree. Each is
//! recorded in the status together with a sub-condition, and the server
//! configuration Secret is rendered from those status fields only.

use super::{child_labels, child_selector, creating_or_ready, secret_volume, AwaitService};
use crate::config::ControllerConfig;
use crate::constants::{CTLOG_IMAGE, TRILLIAN_LOGSERVER_NAME};
use crate::controller::action::resolve_tree::log_server_address;
use crate::controller::action::{
    error_or_failed, failed, Action, ActionContext, ActionError, AwaitDeployment, Directive,
    EnsureChild, Pipeline, ResolveTree, ToCreating, ToInitialize, ToPending, ToReady,
};
use crate::controller::client::{create_typed, get_opt, list_typed};
use crate::controller::keys::generate_key_pair;
use crate::controller::kubernetes::{container, deployment, secret, service, trust_label};
use crate::controller::tree::TreeService;
use crate::crd::{
    name_of, namespace_of, CTlog, Condition, ConditionStatus, ConditionsAware, LocalObjectReference,
    Phase, SecretKeySelector, TreeIdentified, CTLOG_CERT_CONDITION, CTLOG_KEYS_CONDITION,
    CTLOG_SERVER_CONDITION, CTLOG_SERVER_CONFIG_CONDITION,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{KeyToPath, PodSpec, Secret, Service};
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const DEPLOYMENT_NAME: &str = "ctlog";
/// Trust file published by Fulcio
pub const FULCIO_CERT_FILE: &str = "fulcio_v1.crt.pem";
const SERVER_PORT: i32 = 6962;
const CONFIG_KEY: &str = "config";
const LOG_PREFIX: &str = "trusted-artifact-signer";

pub fn keys_secret_name(instance: &CTlog) -> String {
    format!("ctlog-keys-{}", name_of(instance))
}

pub fn config_secret_name(instance: &CTlog) -> String {
    format!("ctlog-config-{}", name_of(instance))
}

fn status_roots(instance: &CTlog) -> &[SecretKeySelector] {
    instance
        .status_ref()
        .map_or(&[], |s| s.root_certificates.as_slice())
}

/// Resolves the root certificates accepted by the log
///
/// Certificates listed in the spec are used as-is; otherwise the log trusts
/// every Secret labelled `rhtas.redhat.com/fulcio_v1.crt.pem`, whose label
/// value names the data key holding the certificate.
#[derive(Debug, Default)]
pub struct ResolveRootCertificates;

#[async_trait]
impl Action<CTlog> for ResolveRootCertificates {
    fn name(&self) -> &str {
        "resolve root certificates"
    }

    fn can_handle(&self, instance: &CTlog) -> bool {
        creating_or_ready(instance)
            && (!instance.is_condition_true(CTLOG_CERT_CONDITION)
                || (!instance.spec.root_certificates.is_empty()
                    && instance.spec.root_certificates != status_roots(instance)))
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut CTlog) -> Directive {
        let roots = if instance.spec.root_certificates.is_empty() {
            match discover_fulcio_roots(ctx, &namespace_of(instance)).await {
                Ok(roots) => roots,
                Err(e) => return error_or_failed(instance, e),
            }
        } else {
            instance.spec.root_certificates.clone()
        };

        if roots.is_empty() {
            info!("Waiting for a Fulcio root certificate");
            return ctx.wait_for_dependency();
        }

        let status = instance.status_mut();
        if status.root_certificates != roots {
            status.root_certificates = roots;
            // the rendered configuration lists the roots
            status.server_config_ref = None;
            status
                .conditions
                .retain(|c| c.r#type != CTLOG_SERVER_CONFIG_CONDITION);
        }
        instance.set_condition(
            Condition::new(CTLOG_CERT_CONDITION, ConditionStatus::True, Phase::Ready)
                .with_message("Fulcio root certificate resolved"),
        );
        Directive::StatusUpdate
    }
}

async fn discover_fulcio_roots(
    ctx: &ActionContext,
    namespace: &str,
) -> Result<Vec<SecretKeySelector>, ActionError> {
    let label = trust_label(FULCIO_CERT_FILE);
    let secrets = list_typed::<Secret>(ctx.client(), namespace, Some(&label)).await?;

    let mut roots: Vec<SecretKeySelector> = secrets
        .iter()
        .filter_map(|s| {
            let key = s.metadata.labels.as_ref()?.get(&label)?;
            s.data.as_ref()?.contains_key(key).then(|| {
                SecretKeySelector::new(s.metadata.name.clone().unwrap_or_default(), key)
            })
        })
        .collect();
    roots.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(roots)
}

/// Resolves the log's key pair
///
/// Keys referenced in the spec win. Otherwise a key pair is generated once
/// into `ctlog-keys-<name>` and reused by every later pass.
#[derive(Debug, Default)]
pub struct ResolveKeys;

impl ResolveKeys {
    fn spec_keys(instance: &CTlog) -> Option<(SecretKeySelector, SecretKeySelector)> {
        Some((
            instance.spec.private_key_ref.clone()?,
            instance.spec.public_key_ref.clone()?,
        ))
    }
}

#[async_trait]
impl Action<CTlog> for ResolveKeys {
    fn name(&self) -> &str {
        "resolve keys"
    }

    fn can_handle(&self, instance: &CTlog) -> bool {
        if !creating_or_ready(instance) {
            return false;
        }
        if !instance.is_condition_true(CTLOG_KEYS_CONDITION) {
            return true;
        }
        let status = instance.status_ref();
        instance.spec.private_key_ref.is_some()
            && (status.and_then(|s| s.private_key_ref.as_ref()) != instance.spec.private_key_ref.as_ref()
                || status.and_then(|s| s.public_key_ref.as_ref())
                    != instance.spec.public_key_ref.as_ref())
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut CTlog) -> Directive {
        let (private, public) = if instance.spec.private_key_ref.is_some() {
            match Self::spec_keys(instance) {
                Some(keys) => keys,
                None => {
                    return failed(
                        instance,
                        ActionError::failed("publicKeyRef is required together with privateKeyRef"),
                    )
                }
            }
        } else {
            match ensure_keys_secret(ctx, instance).await {
                Ok(keys) => keys,
                Err(e) => return error_or_failed(instance, e),
            }
        };

        let status = instance.status_mut();
        if status.private_key_ref.as_ref() != Some(&private) || status.public_key_ref.as_ref() != Some(&public) {
            status.private_key_ref = Some(private);
            status.public_key_ref = Some(public);
            status.server_config_ref = None;
            status
                .conditions
                .retain(|c| c.r#type != CTLOG_SERVER_CONFIG_CONDITION);
        }
        instance.set_condition(
            Condition::new(CTLOG_KEYS_CONDITION, ConditionStatus::True, Phase::Ready)
                .with_message("Keys resolved"),
        );
        Directive::StatusUpdate
    }
}

async fn ensure_keys_secret(
    ctx: &ActionContext,
    instance: &CTlog,
) -> Result<(SecretKeySelector, SecretKeySelector), ActionError> {
    let namespace = namespace_of(instance);
    let name = keys_secret_name(instance);
    let keys = (
        SecretKeySelector::new(&name, "private"),
        SecretKeySelector::new(&name, "public"),
    );
    if get_opt::<Secret>(ctx.client(), &namespace, &name).await?.is_some() {
        return Ok(keys);
    }

    let pair = generate_key_pair()?;
    let mut desired = secret(
        &name,
        &namespace,
        &child_labels(instance, "keys"),
        BTreeMap::from([
            ("private".to_string(), pair.private_pem.into_bytes()),
            ("public".to_string(), pair.public_pem.into_bytes()),
        ]),
    );
    // other components discover the log key by this label
    desired
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(trust_label("ctfe.pub"), "public".to_string());
    if let Some(owner) = instance.controller_owner_ref(&()) {
        desired.metadata.owner_references = Some(vec![owner]);
    }
    create_typed(ctx.client(), &namespace, &desired).await?;
    info!(secret = %name, "Generated CTlog key pair");
    Ok(keys)
}

/// Mount path of the root certificate at `index`
fn root_path(index: usize) -> String {
    format!("/ctfe-keys/roots/{index}/root.pem")
}

/// Render the CT front-end configuration (protobuf text format)
pub fn render_config(namespace: &str, tree_id: i64, roots: &[SecretKeySelector]) -> String {
    let roots: String = (0..roots.len())
        .map(|index| format!("    roots_pem_file: \"{}\"\n", root_path(index)))
        .collect();
    format!(
        r#"backends: {{
  backend: {{
    name: "trillian"
    backend_spec: "{backend}"
  }}
}}
log_configs: {{
  config: {{
    log_id: {tree_id}
    prefix: "{LOG_PREFIX}"
{roots}    private_key: {{
      [type.googleapis.com/keyspb.PEMKeyFile]: {{
        path: "/ctfe-keys/private"
      }}
    }}
    log_backend_name: "trillian"
  }}
}}
"#,
        backend = log_server_address(namespace),
    )
}

fn build_server_config(instance: &CTlog) -> Result<Option<Secret>, ActionError> {
    let Some(status) = instance.status_ref() else {
        return Ok(None);
    };
    let (Some(tree_id), Some(_), Some(_)) = (
        status.tree_id,
        status.private_key_ref.as_ref(),
        status.public_key_ref.as_ref(),
    ) else {
        return Ok(None);
    };
    if status.root_certificates.is_empty() {
        return Ok(None);
    }

    let namespace = namespace_of(instance);
    let config = render_config(&namespace, tree_id, &status.root_certificates);
    Ok(Some(secret(
        &config_secret_name(instance),
        &namespace,
        &child_labels(instance, "server-config"),
        BTreeMap::from([(CONFIG_KEY.to_string(), config.into_bytes())]),
    )))
}

fn record_server_config(instance: &mut CTlog, config: &Secret) -> bool {
    let name = config.metadata.name.clone().unwrap_or_default();
    let recorded = instance.is_condition_true(CTLOG_SERVER_CONFIG_CONDITION)
        && instance
            .status_ref()
            .and_then(|s| s.server_config_ref.as_ref())
            .is_some_and(|r| r.name == name);
    if recorded {
        return false;
    }
    instance.status_mut().server_config_ref = Some(LocalObjectReference { name });
    instance.set_condition(
        Condition::new(CTLOG_SERVER_CONFIG_CONDITION, ConditionStatus::True, Phase::Ready)
            .with_message("Server config created"),
    );
    true
}

fn build_deployment(instance: &CTlog) -> Result<Option<Deployment>, ActionError> {
    let Some(status) = instance.status_ref() else {
        return Ok(None);
    };
    let (Some(config_ref), Some(private)) = (
        status.server_config_ref.as_ref(),
        status.private_key_ref.as_ref(),
    ) else {
        return Ok(None);
    };

    let mut volumes = vec![];
    let mut mounts = vec![];
    let (volume, mount) = secret_volume("config", &config_ref.name, "/ctfe-config");
    volumes.push(volume);
    mounts.push(mount);
    let (mut volume, mut mount) = secret_volume("private", &private.name, "/ctfe-keys/private");
    if let Some(source) = volume.secret.as_mut() {
        source.items = Some(vec![KeyToPath {
            key: private.key.clone(),
            path: "private".to_string(),
            mode: None,
        }]);
    }
    mount.sub_path = Some("private".to_string());
    volumes.push(volume);
    mounts.push(mount);
    for (index, root) in status.root_certificates.iter().enumerate() {
        let volume_name = format!("root-{index}");
        let (mut volume, mount) =
            secret_volume(&volume_name, &root.name, &format!("/ctfe-keys/roots/{index}"));
        if let Some(source) = volume.secret.as_mut() {
            source.items = Some(vec![KeyToPath {
                key: root.key.clone(),
                path: "root.pem".to_string(),
                mode: None,
            }]);
        }
        volumes.push(volume);
        mounts.push(mount);
    }

    let mut server = container(
        DEPLOYMENT_NAME,
        CTLOG_IMAGE,
        vec![
            format!("--http_endpoint=0.0.0.0:{SERVER_PORT}"),
            format!("--log_config=/ctfe-config/{CONFIG_KEY}"),
            "--alsologtostderr".to_string(),
        ],
        &[("http", SERVER_PORT)],
    );
    server.volume_mounts = Some(mounts);

    Ok(Some(deployment(
        DEPLOYMENT_NAME,
        &namespace_of(instance),
        &child_labels(instance, DEPLOYMENT_NAME),
        &child_selector(instance, DEPLOYMENT_NAME),
        PodSpec {
            containers: vec![server],
            volumes: Some(volumes),
            ..PodSpec::default()
        },
    )))
}

fn build_service(instance: &CTlog) -> Result<Option<Service>, ActionError> {
    Ok(Some(service(
        DEPLOYMENT_NAME,
        &namespace_of(instance),
        &child_labels(instance, DEPLOYMENT_NAME),
        &child_selector(instance, DEPLOYMENT_NAME),
        &[("http", SERVER_PORT)],
    )))
}

/// CTlog pipeline
pub fn pipeline(trees: Arc<dyn TreeService>, config: &ControllerConfig) -> Pipeline<CTlog> {
    Pipeline::new()
        .then(ToPending::new())
        .then(AwaitService::new(TRILLIAN_LOGSERVER_NAME))
        .then(ToCreating::new())
        .then(ResolveRootCertificates)
        .then(ResolveKeys)
        .then(ResolveTree::new(trees, config.tree_create_timeout()))
        .then(
            EnsureChild::new(
                "ensure server config",
                creating_or_ready::<CTlog>,
                build_server_config,
            )
            .recording(record_server_config),
        )
        .then(EnsureChild::new(
            "ensure ctlog deployment",
            creating_or_ready::<CTlog>,
            build_deployment,
        ))
        .then(EnsureChild::new(
            "ensure ctlog service",
            creating_or_ready::<CTlog>,
            build_service,
        ))
        .then(ToInitialize::new())
        .then(AwaitDeployment::new(DEPLOYMENT_NAME, CTLOG_SERVER_CONDITION))
        .then(ToReady::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::action::testing::fixture;
    use crate::controller::client::get_typed;
    use crate::controller::kubernetes::secret_value;
    use crate::crd::CTlogSpec;

    fn ctlog(phase: Phase) -> CTlog {
        let mut instance = CTlog::new("ctlog", CTlogSpec::default());
        instance.metadata.namespace = Some("ns".to_string());
        instance.metadata.uid = Some("ctlog-uid".to_string());
        instance.set_condition(Condition::ready(phase));
        instance
    }

    async fn fulcio_secret(f: &crate::controller::action::testing::Fixture, name: &str) {
        let mut labels = BTreeMap::new();
        labels.insert(trust_label(FULCIO_CERT_FILE), "cert".to_string());
        let cert = secret(name, "ns", &labels, BTreeMap::from([("cert".to_string(), b"PEM".to_vec())]));
        create_typed(f.client.as_ref(), "ns", &cert).await.unwrap();
    }

    #[tokio::test]
    async fn test_roots_wait_for_fulcio_secret() {
        let f = fixture();
        let mut instance = ctlog(Phase::Creating);

        let directive = ResolveRootCertificates.handle(&f.ctx, &mut instance).await;
        assert!(matches!(directive, Directive::Requeue(_)));

        fulcio_secret(&f, "fulcio-cert").await;
        let directive = ResolveRootCertificates.handle(&f.ctx, &mut instance).await;

        assert!(matches!(directive, Directive::StatusUpdate));
        assert_eq!(status_roots(&instance), &[SecretKeySelector::new("fulcio-cert", "cert")]);
        assert!(!ResolveRootCertificates.can_handle(&instance));
    }

    #[tokio::test]
    async fn test_generated_keys_are_reused() {
        let f = fixture();
        let mut instance = ctlog(Phase::Creating);

        ResolveKeys.handle(&f.ctx, &mut instance).await;
        let first: Secret = get_typed(f.client.as_ref(), "ns", "ctlog-keys-ctlog").await.unwrap();
        assert!(secret_value(&first, "public").is_some());

        instance.status = None;
        instance.set_condition(Condition::ready(Phase::Creating));
        ResolveKeys.handle(&f.ctx, &mut instance).await;
        let second: Secret = get_typed(f.client.as_ref(), "ns", "ctlog-keys-ctlog").await.unwrap();

        assert_eq!(first.data, second.data);
        assert_eq!(
            instance.status_ref().unwrap().private_key_ref,
            Some(SecretKeySelector::new("ctlog-keys-ctlog", "private"))
        );
    }

    #[tokio::test]
    async fn test_private_key_without_public_key_fails() {
        let f = fixture();
        let mut instance = ctlog(Phase::Creating);
        instance.spec.private_key_ref = Some(SecretKeySelector::new("mine", "private"));

        let directive = ResolveKeys.handle(&f.ctx, &mut instance).await;

        assert!(matches!(directive, Directive::ErrorWithStatusUpdate(_)));
        assert_eq!(instance.phase(), Some(Phase::Failure));
    }

    #[test]
    fn test_render_config_embeds_tree_and_roots() {
        let config = render_config(
            "ns",
            1234,
            &[SecretKeySelector::new("a", "cert"), SecretKeySelector::new("b", "cert")],
        );
        assert!(config.contains("log_id: 1234"));
        assert!(config.contains("backend_spec: \"trillian-logserver.ns.svc:8091\""));
        assert!(config.contains("/ctfe-keys/roots/1/root.pem"));
        assert_eq!(config.matches("roots_pem_file").count(), 2);
        assert!(config.contains("    roots_pem_file: \"/ctfe-keys/roots/1/root.pem\"\n    private_key: {\n"));
        assert!(config.starts_with("backends: {\n"));
        assert!(config.ends_with("  }\n}\n"));
        assert_eq!(config.matches('{').count(), config.matches('}').count());
    }

    #[test]
    fn test_server_config_requires_tree_keys_and_roots() {
        let mut instance = ctlog(Phase::Creating);
        assert!(build_server_config(&instance).unwrap().is_none());

        let status = instance.status_mut();
        status.tree_id = Some(7);
        status.private_key_ref = Some(SecretKeySelector::new("k", "private"));
        status.public_key_ref = Some(SecretKeySelector::new("k", "public"));
        assert!(build_server_config(&instance).unwrap().is_none());

        instance.status_mut().root_certificates = vec![SecretKeySelector::new("fulcio", "cert")];
        let config = build_server_config(&instance).unwrap().unwrap();
        assert_eq!(config.metadata.name.as_deref(), Some("ctlog-config-ctlog"));

        assert!(record_server_config(&mut instance, &config));
        assert!(!record_server_config(&mut instance, &config));
    }

    #[test]
    fn test_new_tree_invalidates_server_config() {
        let mut instance = ctlog(Phase::Ready);
        instance.status_mut().tree_id = Some(1);
        instance.status_mut().server_config_ref = Some(LocalObjectReference {
            name: "ctlog-config-ctlog".to_string(),
        });

        instance.set_status_tree_id(2);

        assert!(instance.status_ref().unwrap().server_config_ref.is_none());
        assert!(build_deployment(&instance).unwrap().is_none());
    }
}
