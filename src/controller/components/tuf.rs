//! # TUF
//!
//! Metadata repository serving the trust root of the other components.
//!
//! The repository is seeded once by an init Job that reads the resolved key
//! Secrets and writes into the repository volume; the server then serves
//! that volume.

use super::{
    child_labels, child_selector, creating_or_ready, pvc_volume, replace_condition, secret_volume,
};
use crate::constants::{TUF_INIT_IMAGE, TUF_SERVER_IMAGE};
use crate::controller::action::{
    error_or_failed, failed, in_phase, Action, ActionContext, ActionError, AwaitDeployment,
    Directive, EnsureChild, Pipeline, ToCreating, ToInitialize, ToPending, ToReady,
};
use crate::controller::action::ensure;
use crate::controller::client::{api_resource, get_opt, list_typed};
use crate::controller::events::reasons;
use crate::controller::kubernetes::{
    container, deployment, job, job_state, persistent_volume_claim, service, trust_label, JobState,
};
use crate::crd::{
    name_of, namespace_of, Condition, ConditionStatus, ConditionsAware, Phase, SecretKeySelector,
    Tuf, TufKey, TUF_REPOSITORY_CONDITION, TUF_SERVER_CONDITION,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{KeyToPath, PersistentVolumeClaim, PodSpec, Secret, Service};
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::Resource;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const DEPLOYMENT_NAME: &str = "tuf";
/// Pod template annotation listing the key sources the repository was seeded from
pub const TRUSTED_KEYS_ANNOTATION: &str = "rhtas.redhat.com/trusted-keys";
const SERVER_PORT: i32 = 8080;
const REPOSITORY_PATH: &str = "/var/run/target";
const WAITING_FOR_JOB: &str = "Waiting for repository init job";

pub fn pvc_name(instance: &Tuf) -> String {
    format!("tuf-{}", name_of(instance))
}

pub fn init_job_name(instance: &Tuf) -> String {
    format!("tuf-repository-init-{}", name_of(instance))
}

/// Resolves the Secret behind every trust file
///
/// A key with a `secretRef` is used as-is. Otherwise the key is looked up
/// through the `rhtas.redhat.com/<file>` label, whose value names the data
/// key. Every key gets a sub-condition named after its file.
///
/// Keys are re-resolved on every pass, so labelled Secrets can be rotated on
/// a running repository:
///
/// - a missing key sends the resource back to `Pending` until it reappears
/// - a key that moved to another Secret drops the repository and server
///   conditions and removes the init Job, so the repository is seeded again
#[derive(Debug, Default)]
pub struct ResolveTufKeys;

fn key_condition(name: &str, found: bool) -> Condition {
    if found {
        Condition::new(name, ConditionStatus::True, Phase::Ready).with_message("Key resolved")
    } else {
        Condition::new(name, ConditionStatus::False, Phase::Pending)
            .with_message(format!("Waiting for a Secret labelled {}", trust_label(name)))
    }
}

#[async_trait]
impl Action<Tuf> for ResolveTufKeys {
    fn name(&self) -> &str {
        "resolve keys"
    }

    fn can_handle(&self, instance: &Tuf) -> bool {
        in_phase(
            instance,
            &[Phase::Pending, Phase::Creating, Phase::Initialize, Phase::Ready],
        )
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut Tuf) -> Directive {
        let namespace = namespace_of(instance);
        let mut resolved = Vec::with_capacity(instance.spec.keys.len());
        let mut missing = Vec::new();
        for key in &instance.spec.keys {
            if key.secret_ref.is_some() {
                resolved.push(key.clone());
                continue;
            }
            match find_labelled_secret(ctx, &namespace, &key.name).await {
                Ok(Some(secret_ref)) => resolved.push(TufKey {
                    name: key.name.clone(),
                    secret_ref: Some(secret_ref),
                }),
                Ok(None) => missing.push(key.name.clone()),
                Err(e) => return error_or_failed(instance, e),
            }
        }

        let names: Vec<String> = instance.spec.keys.iter().map(|k| k.name.clone()).collect();
        let mut changed = false;
        for name in &names {
            changed |= replace_condition(instance, key_condition(name, !missing.contains(name)));
        }

        if instance.resolved_keys() != resolved.as_slice() {
            if instance.find_condition(TUF_REPOSITORY_CONDITION).is_some() {
                if let Err(e) = remove_init_job(ctx, instance).await {
                    return error_or_failed(instance, e);
                }
                instance.status_mut().conditions.retain(|c| {
                    c.r#type != TUF_REPOSITORY_CONDITION && c.r#type != TUF_SERVER_CONDITION
                });
                ctx.event(
                    instance,
                    EventType::Normal,
                    reasons::KEY_CHANGED,
                    "Trusted keys changed, reinitializing repository",
                )
                .await;
            }
            instance.status_mut().keys = resolved;
            changed = true;
        }

        if !missing.is_empty() {
            if instance.phase() != Some(Phase::Pending) {
                let message = format!("Missing trusted keys: {}", missing.join(", "));
                warn!(keys = ?missing, "Trusted key Secret disappeared");
                ctx.event(instance, EventType::Warning, reasons::KEY_MISSING, message.clone())
                    .await;
                instance.set_condition(Condition::ready(Phase::Pending).with_message(message));
                return Directive::StatusUpdate;
            }
            if changed {
                return Directive::StatusUpdate;
            }
            info!(keys = ?missing, "Waiting for trust file secrets");
            return ctx.wait_for_dependency();
        }

        if !changed {
            return Directive::Continue;
        }
        if in_phase(instance, &[Phase::Initialize, Phase::Ready])
            && !instance.is_condition_true(TUF_REPOSITORY_CONDITION)
        {
            instance.set_condition(
                Condition::ready(Phase::Creating).with_message("Trusted keys changed"),
            );
        }
        Directive::StatusUpdate
    }
}

/// Delete the init Job so the next [`InitRepository`] run starts a new one
async fn remove_init_job(ctx: &ActionContext, instance: &Tuf) -> Result<(), ActionError> {
    let name = init_job_name(instance);
    match ctx
        .client()
        .delete(&api_resource::<Job>(), &namespace_of(instance), &name)
        .await
    {
        Ok(()) => {
            info!(job = %name, "Removed init job seeded from previous keys");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(ActionError::Client(e)),
    }
}

/// Trusted key sources, stamped on the server pod so a rotation rolls it
fn keys_fingerprint(instance: &Tuf) -> String {
    instance
        .resolved_keys()
        .iter()
        .filter_map(|k| {
            let secret_ref = k.secret_ref.as_ref()?;
            Some(format!("{}={}/{}", k.name, secret_ref.name, secret_ref.key))
        })
        .collect::<Vec<_>>()
        .join(",")
}

async fn find_labelled_secret(
    ctx: &ActionContext,
    namespace: &str,
    file_name: &str,
) -> Result<Option<SecretKeySelector>, ActionError> {
    let label = trust_label(file_name);
    let mut secrets = list_typed::<Secret>(ctx.client(), namespace, Some(&label)).await?;
    secrets.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    Ok(secrets.iter().find_map(|s| {
        let key = s.metadata.labels.as_ref()?.get(&label)?;
        s.data.as_ref()?.contains_key(key).then(|| {
            SecretKeySelector::new(s.metadata.name.clone().unwrap_or_default(), key)
        })
    }))
}

fn build_pvc(instance: &Tuf) -> Result<Option<PersistentVolumeClaim>, ActionError> {
    Ok(Some(persistent_volume_claim(
        &pvc_name(instance),
        &namespace_of(instance),
        &child_labels(instance, DEPLOYMENT_NAME),
        &instance.spec.pvc,
    )))
}

fn record_pvc(instance: &mut Tuf, pvc: &PersistentVolumeClaim) -> bool {
    let name = pvc.metadata.name.clone();
    let status = instance.status_mut();
    if status.pvc_name == name {
        return false;
    }
    status.pvc_name = name;
    true
}

fn claim_name(instance: &Tuf) -> String {
    instance
        .pvc_name()
        .map_or_else(|| pvc_name(instance), str::to_string)
}

fn build_init_job(instance: &Tuf) -> Job {
    let (repo_volume, repo_mount) = pvc_volume("repository", &claim_name(instance), REPOSITORY_PATH);
    let mut volumes = vec![repo_volume];
    let mut mounts = vec![repo_mount];
    let mut args = vec![format!("--export-keys={REPOSITORY_PATH}")];

    for (index, key) in instance.resolved_keys().iter().enumerate() {
        let Some(secret_ref) = key.secret_ref.as_ref() else {
            continue;
        };
        let volume_name = format!("key-{index}");
        let (mut volume, mount) =
            secret_volume(&volume_name, &secret_ref.name, &format!("/var/run/keys/{index}"));
        if let Some(source) = volume.secret.as_mut() {
            source.items = Some(vec![KeyToPath {
                key: secret_ref.key.clone(),
                path: key.name.clone(),
                mode: None,
            }]);
        }
        args.push(format!("--key=/var/run/keys/{index}/{}", key.name));
        volumes.push(volume);
        mounts.push(mount);
    }

    let mut init = container("tuf-init", TUF_INIT_IMAGE, args, &[]);
    init.volume_mounts = Some(mounts);
    job(
        &init_job_name(instance),
        &namespace_of(instance),
        &child_labels(instance, "tuf-repository-init"),
        PodSpec {
            containers: vec![init],
            volumes: Some(volumes),
            ..PodSpec::default()
        },
    )
}

/// Seeds the repository through a one-shot Job
///
/// The Job is created once and polled until it finishes. A failed Job is
/// deleted so that the next attempt after recovery starts from scratch.
#[derive(Debug, Default)]
pub struct InitRepository;

#[async_trait]
impl Action<Tuf> for InitRepository {
    fn name(&self) -> &str {
        "initialize repository"
    }

    fn can_handle(&self, instance: &Tuf) -> bool {
        creating_or_ready(instance) && !instance.is_condition_true(TUF_REPOSITORY_CONDITION)
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut Tuf) -> Directive {
        let namespace = namespace_of(instance);
        let name = init_job_name(instance);

        let existing = match get_opt::<Job>(ctx.client(), &namespace, &name).await {
            Ok(existing) => existing,
            Err(e) => return error_or_failed(instance, ActionError::Client(e)),
        };
        let Some(existing) = existing else {
            let mut desired = build_init_job(instance);
            if let Some(owner) = instance.controller_owner_ref(&()) {
                desired.metadata.owner_references = Some(vec![owner]);
            }
            if let Err(e) = ensure(ctx.client(), &desired).await {
                return error_or_failed(instance, ActionError::Client(e));
            }
            instance.set_condition(
                Condition::new(TUF_REPOSITORY_CONDITION, ConditionStatus::False, Phase::Creating)
                    .with_message(WAITING_FOR_JOB),
            );
            return Directive::StatusUpdate;
        };

        match job_state(&existing) {
            JobState::Running => {
                let waiting = instance
                    .find_condition(TUF_REPOSITORY_CONDITION)
                    .is_some_and(|c| c.message.as_deref() == Some(WAITING_FOR_JOB));
                if waiting {
                    return ctx.wait_for_dependency();
                }
                instance.set_condition(
                    Condition::new(TUF_REPOSITORY_CONDITION, ConditionStatus::False, Phase::Creating)
                        .with_message(WAITING_FOR_JOB),
                );
                Directive::StatusUpdate
            }
            JobState::Succeeded => {
                instance.set_condition(
                    Condition::new(TUF_REPOSITORY_CONDITION, ConditionStatus::True, Phase::Ready)
                        .with_message("Repository initialized"),
                );
                Directive::StatusUpdate
            }
            JobState::Failed => {
                if let Err(e) = ctx
                    .client()
                    .delete(&api_resource::<Job>(), &namespace, &name)
                    .await
                {
                    warn!(job = %name, error = %e, "Failed to delete failed init job");
                }
                instance.set_condition(
                    Condition::new(TUF_REPOSITORY_CONDITION, ConditionStatus::False, Phase::Failure)
                        .with_message("Repository init job failed"),
                );
                failed(instance, ActionError::failed(format!("job {name} failed")))
            }
        }
    }
}

fn build_deployment(instance: &Tuf) -> Result<Option<Deployment>, ActionError> {
    let (volume, mount) = pvc_volume("repository", &claim_name(instance), REPOSITORY_PATH);
    let mut server = container(DEPLOYMENT_NAME, TUF_SERVER_IMAGE, vec![], &[("http", SERVER_PORT)]);
    server.volume_mounts = Some(vec![mount]);

    let mut desired = deployment(
        DEPLOYMENT_NAME,
        &namespace_of(instance),
        &child_labels(instance, DEPLOYMENT_NAME),
        &child_selector(instance, DEPLOYMENT_NAME),
        PodSpec {
            containers: vec![server],
            volumes: Some(vec![volume]),
            ..PodSpec::default()
        },
    );
    if let Some(spec) = desired.spec.as_mut() {
        spec.template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(TRUSTED_KEYS_ANNOTATION.to_string(), keys_fingerprint(instance));
    }
    Ok(Some(desired))
}

fn build_service(instance: &Tuf) -> Result<Option<Service>, ActionError> {
    Ok(Some(service(
        DEPLOYMENT_NAME,
        &namespace_of(instance),
        &child_labels(instance, DEPLOYMENT_NAME),
        &child_selector(instance, DEPLOYMENT_NAME),
        &[("http", SERVER_PORT)],
    )))
}

/// TUF pipeline
pub fn pipeline() -> Pipeline<Tuf> {
    Pipeline::new()
        .then(ToPending::new())
        .then(ResolveTufKeys)
        .then(ToCreating::new())
        .then(
            EnsureChild::new("ensure tuf pvc", creating_or_ready::<Tuf>, build_pvc)
                .recording(record_pvc),
        )
        .then(InitRepository)
        .then(EnsureChild::new(
            "ensure tuf deployment",
            creating_or_ready::<Tuf>,
            build_deployment,
        ))
        .then(EnsureChild::new(
            "ensure tuf service",
            creating_or_ready::<Tuf>,
            build_service,
        ))
        .then(ToInitialize::new())
        .then(AwaitDeployment::new(DEPLOYMENT_NAME, TUF_SERVER_CONDITION))
        .then(ToReady::new())
}
