//! # Trillian
//!
//! Log backend: a MySQL database (optional), the log server and the log signer.
//!
//! The log server is exposed as the `trillian-logserver` Service, which the
//! log front-ends in the same namespace use to create their trees.

use super::{child_labels, child_selector, creating_or_ready, pvc_volume};
use crate::constants::{
    TRILLIAN_DB_IMAGE, TRILLIAN_DB_NAME, TRILLIAN_DB_PORT, TRILLIAN_GRPC_PORT,
    TRILLIAN_LOGSERVER_IMAGE, TRILLIAN_LOGSERVER_NAME, TRILLIAN_LOGSIGNER_IMAGE,
    TRILLIAN_LOGSIGNER_NAME, TRILLIAN_METRICS_PORT,
};
use crate::controller::action::resolve_tree::log_server_address;
use crate::controller::action::{
    ensure, error_or_failed, failed, set_ready_message, Action, ActionContext, ActionError,
    AwaitDeployment, Directive, EnsureChild, Pipeline, ToCreating, ToInitialize, ToPending,
    ToReady,
};
use crate::controller::client::get_opt;
use crate::controller::kubernetes::{
    container, deployment, persistent_volume_claim, secret, secret_env, service,
};
use crate::crd::{
    name_of, namespace_of, LocalObjectReference, Trillian, DB_CONDITION,
    TRILLIAN_SERVER_CONDITION, TRILLIAN_SIGNER_CONDITION,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaim, PodSpec, Secret, Service};
use kube::Resource;
use std::collections::BTreeMap;
use tracing::info;

const DB_USER: &str = "mysql";
const DB_DATABASE: &str = "trillian";

/// Keys every database Secret carries
pub const DB_SECRET_KEYS: [&str; 5] = [
    "mysql-host",
    "mysql-port",
    "mysql-user",
    "mysql-password",
    "mysql-database",
];

pub fn db_secret_name(instance: &Trillian) -> String {
    format!("trillian-mysql-{}", name_of(instance))
}

pub fn db_pvc_name(instance: &Trillian) -> String {
    format!("trillian-mysql-{}-pvc", name_of(instance))
}

fn creates_database(instance: &Trillian) -> bool {
    instance.spec.database.create
}

fn db_secret_ref(instance: &Trillian) -> Option<&LocalObjectReference> {
    instance
        .database_status()
        .and_then(|db| db.database_secret_ref.as_ref())
}

/// Settles which Secret holds the database credentials
///
/// A bring-your-own Secret from the spec wins. Otherwise credentials are
/// generated once; the Secret is never rewritten, so existing data stays
/// readable after a restart.
#[derive(Debug, Default)]
pub struct ResolveDatabaseSecret;

#[async_trait]
impl Action<Trillian> for ResolveDatabaseSecret {
    fn name(&self) -> &str {
        "resolve database secret"
    }

    fn can_handle(&self, instance: &Trillian) -> bool {
        creating_or_ready(instance)
            && match &instance.spec.database.database_secret_ref {
                Some(spec_ref) => db_secret_ref(instance) != Some(spec_ref),
                None => db_secret_ref(instance).is_none(),
            }
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut Trillian) -> Directive {
        if let Some(spec_ref) = instance.spec.database.database_secret_ref.clone() {
            instance.database_status_mut().database_secret_ref = Some(spec_ref);
            set_ready_message(instance, "Using database secret from spec");
            return Directive::StatusUpdate;
        }
        if !creates_database(instance) {
            return failed(
                instance,
                ActionError::failed("database.databaseSecretRef is required when database.create is false"),
            );
        }

        let namespace = namespace_of(instance);
        let name = db_secret_name(instance);
        match get_opt::<Secret>(ctx.client(), &namespace, &name).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let mut desired = generated_db_secret(instance, &name, &namespace);
                if let Some(owner) = instance.controller_owner_ref(&()) {
                    desired.metadata.owner_references = Some(vec![owner]);
                }
                if let Err(e) = ensure(ctx.client(), &desired).await {
                    return error_or_failed(instance, ActionError::Client(e));
                }
                info!(secret = %name, "Generated database credentials");
            }
            Err(e) => return error_or_failed(instance, ActionError::Client(e)),
        }

        instance.database_status_mut().database_secret_ref = Some(LocalObjectReference { name });
        set_ready_message(instance, "Database secret created");
        Directive::StatusUpdate
    }
}

fn generated_db_secret(instance: &Trillian, name: &str, namespace: &str) -> Secret {
    let password = uuid::Uuid::new_v4().simple().to_string();
    let root_password = uuid::Uuid::new_v4().simple().to_string();
    let data = BTreeMap::from([
        ("mysql-host".to_string(), TRILLIAN_DB_NAME.as_bytes().to_vec()),
        ("mysql-port".to_string(), TRILLIAN_DB_PORT.to_string().into_bytes()),
        ("mysql-user".to_string(), DB_USER.as_bytes().to_vec()),
        ("mysql-password".to_string(), password.into_bytes()),
        ("mysql-database".to_string(), DB_DATABASE.as_bytes().to_vec()),
        ("mysql-root-password".to_string(), root_password.into_bytes()),
    ]);
    secret(name, namespace, &child_labels(instance, TRILLIAN_DB_NAME), data)
}

fn build_db_pvc(instance: &Trillian) -> Result<Option<PersistentVolumeClaim>, ActionError> {
    Ok(creates_database(instance).then(|| {
        persistent_volume_claim(
            &db_pvc_name(instance),
            &namespace_of(instance),
            &child_labels(instance, TRILLIAN_DB_NAME),
            &instance.spec.database.pvc,
        )
    }))
}

fn record_db_pvc(instance: &mut Trillian, pvc: &PersistentVolumeClaim) -> bool {
    let name = pvc.metadata.name.clone();
    let db = instance.database_status_mut();
    if db.pvc_name == name {
        return false;
    }
    db.pvc_name = name;
    true
}

/// Environment shared by the log server and signer
fn db_env(secret_name: &str) -> Vec<EnvVar> {
    vec![
        secret_env("MYSQL_HOSTNAME", secret_name, "mysql-host"),
        secret_env("MYSQL_PORT", secret_name, "mysql-port"),
        secret_env("MYSQL_USER", secret_name, "mysql-user"),
        secret_env("MYSQL_PASSWORD", secret_name, "mysql-password"),
        secret_env("MYSQL_DATABASE", secret_name, "mysql-database"),
    ]
}

fn trillian_args(extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "--storage_system=mysql".to_string(),
        "--quota_system=mysql".to_string(),
        "--mysql_uri=$(MYSQL_USER):$(MYSQL_PASSWORD)@tcp($(MYSQL_HOSTNAME):$(MYSQL_PORT))/$(MYSQL_DATABASE)"
            .to_string(),
        format!("--rpc_endpoint=0.0.0.0:{TRILLIAN_GRPC_PORT}"),
        format!("--http_endpoint=0.0.0.0:{TRILLIAN_METRICS_PORT}"),
        "--alsologtostderr".to_string(),
    ];
    args.extend(extra.iter().map(|arg| (*arg).to_string()));
    args
}

fn build_db_deployment(instance: &Trillian) -> Result<Option<Deployment>, ActionError> {
    if !creates_database(instance) {
        return Ok(None);
    }
    let Some(secret_ref) = db_secret_ref(instance) else {
        return Ok(None);
    };
    let (volume, mount) = pvc_volume("storage", &db_pvc_name(instance), "/var/lib/mysql");
    let mut db = container(TRILLIAN_DB_NAME, TRILLIAN_DB_IMAGE, vec![], &[("mysql", TRILLIAN_DB_PORT)]);
    db.env = Some(vec![
        secret_env("MYSQL_ROOT_PASSWORD", &secret_ref.name, "mysql-root-password"),
        secret_env("MYSQL_USER", &secret_ref.name, "mysql-user"),
        secret_env("MYSQL_PASSWORD", &secret_ref.name, "mysql-password"),
        secret_env("MYSQL_DATABASE", &secret_ref.name, "mysql-database"),
    ]);
    db.volume_mounts = Some(vec![mount]);

    Ok(Some(deployment(
        TRILLIAN_DB_NAME,
        &namespace_of(instance),
        &child_labels(instance, TRILLIAN_DB_NAME),
        &child_selector(instance, TRILLIAN_DB_NAME),
        PodSpec {
            containers: vec![db],
            volumes: Some(vec![volume]),
            ..PodSpec::default()
        },
    )))
}

fn build_db_service(instance: &Trillian) -> Result<Option<Service>, ActionError> {
    Ok(creates_database(instance).then(|| {
        service(
            TRILLIAN_DB_NAME,
            &namespace_of(instance),
            &child_labels(instance, TRILLIAN_DB_NAME),
            &child_selector(instance, TRILLIAN_DB_NAME),
            &[("mysql", TRILLIAN_DB_PORT)],
        )
    }))
}

fn trillian_deployment(
    instance: &Trillian,
    name: &str,
    image: &str,
    extra_args: &[&str],
) -> Option<Deployment> {
    let secret_ref = db_secret_ref(instance)?;
    let mut server = container(
        name,
        image,
        trillian_args(extra_args),
        &[("grpc", TRILLIAN_GRPC_PORT), ("metrics", TRILLIAN_METRICS_PORT)],
    );
    server.env = Some(db_env(&secret_ref.name));

    Some(deployment(
        name,
        &namespace_of(instance),
        &child_labels(instance, name),
        &child_selector(instance, name),
        PodSpec {
            containers: vec![server],
            ..PodSpec::default()
        },
    ))
}

fn build_server_deployment(instance: &Trillian) -> Result<Option<Deployment>, ActionError> {
    Ok(trillian_deployment(
        instance,
        TRILLIAN_LOGSERVER_NAME,
        TRILLIAN_LOGSERVER_IMAGE,
        &[],
    ))
}

fn build_server_service(instance: &Trillian) -> Result<Option<Service>, ActionError> {
    Ok(Some(service(
        TRILLIAN_LOGSERVER_NAME,
        &namespace_of(instance),
        &child_labels(instance, TRILLIAN_LOGSERVER_NAME),
        &child_selector(instance, TRILLIAN_LOGSERVER_NAME),
        &[("grpc", TRILLIAN_GRPC_PORT), ("metrics", TRILLIAN_METRICS_PORT)],
    )))
}

fn build_signer_deployment(instance: &Trillian) -> Result<Option<Deployment>, ActionError> {
    Ok(trillian_deployment(
        instance,
        TRILLIAN_LOGSIGNER_NAME,
        TRILLIAN_LOGSIGNER_IMAGE,
        &["--force_master"],
    ))
}

fn publish_url(instance: &mut Trillian) {
    let url = log_server_address(&namespace_of(instance));
    instance.status.get_or_insert_with(Default::default).url = Some(url);
}

/// Trillian pipeline
pub fn pipeline() -> Pipeline<Trillian> {
    Pipeline::new()
        .then(ToPending::new())
        .then(ToCreating::new())
        .then(ResolveDatabaseSecret)
        .then(
            EnsureChild::new("ensure database pvc", creating_or_ready::<Trillian>, build_db_pvc)
                .recording(record_db_pvc),
        )
        .then(EnsureChild::new(
            "ensure database deployment",
            creating_or_ready::<Trillian>,
            build_db_deployment,
        ))
        .then(EnsureChild::new(
            "ensure database service",
            creating_or_ready::<Trillian>,
            build_db_service,
        ))
        .then(EnsureChild::new(
            "ensure log server deployment",
            creating_or_ready::<Trillian>,
            build_server_deployment,
        ))
        .then(EnsureChild::new(
            "ensure log server service",
            creating_or_ready::<Trillian>,
            build_server_service,
        ))
        .then(EnsureChild::new(
            "ensure log signer deployment",
            creating_or_ready::<Trillian>,
            build_signer_deployment,
        ))
        .then(ToInitialize::new())
        .then(AwaitDeployment::new(TRILLIAN_DB_NAME, DB_CONDITION).only_if(creates_database))
        .then(AwaitDeployment::new(TRILLIAN_LOGSERVER_NAME, TRILLIAN_SERVER_CONDITION).on_ready(publish_url))
        .then(AwaitDeployment::new(TRILLIAN_LOGSIGNER_NAME, TRILLIAN_SIGNER_CONDITION))
        .then(ToReady::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::action::testing::fixture;
    use crate::controller::client::get_typed;
    use crate::controller::components::testing::{make_available, step};
    use crate::controller::kubernetes::secret_value;
    use crate::crd::{Condition, ConditionsAware, Phase, TrillianSpec};

    fn trillian(phase: Option<Phase>) -> Trillian {
        let mut instance = Trillian::new("trillian", TrillianSpec::default());
        instance.metadata.namespace = Some("ns".to_string());
        instance.metadata.uid = Some("trillian-uid".to_string());
        if let Some(phase) = phase {
            instance.set_condition(Condition::ready(phase));
        }
        instance
    }

    #[tokio::test]
    async fn test_generated_credentials_are_not_rewritten() {
        let f = fixture();
        let mut instance = trillian(Some(Phase::Creating));

        ResolveDatabaseSecret.handle(&f.ctx, &mut instance).await;
        let first: Secret = get_typed(f.client.as_ref(), "ns", "trillian-mysql-trillian").await.unwrap();
        assert_eq!(secret_value(&first, "mysql-host").as_deref(), Some(TRILLIAN_DB_NAME));
        assert!(DB_SECRET_KEYS.iter().all(|key| secret_value(&first, key).is_some()));

        instance.status = None;
        instance.set_condition(Condition::ready(Phase::Creating));
        ResolveDatabaseSecret.handle(&f.ctx, &mut instance).await;
        let second: Secret = get_typed(f.client.as_ref(), "ns", "trillian-mysql-trillian").await.unwrap();

        assert_eq!(first.data, second.data);
        assert!(!ResolveDatabaseSecret.can_handle(&instance));
    }

    #[tokio::test]
    async fn test_external_database_requires_secret() {
        let f = fixture();
        let mut instance = trillian(Some(Phase::Creating));
        instance.spec.database.create = false;

        let directive = ResolveDatabaseSecret.handle(&f.ctx, &mut instance).await;

        assert!(matches!(directive, Directive::ErrorWithStatusUpdate(_)));
        assert_eq!(instance.phase(), Some(Phase::Failure));
    }

    #[tokio::test]
    async fn test_external_database_skips_database_objects() {
        let f = fixture();
        let mut instance = trillian(Some(Phase::Creating));
        instance.spec.database.create = false;
        instance.spec.database.database_secret_ref = Some(LocalObjectReference {
            name: "external-db".to_string(),
        });
        let pipeline = pipeline();

        let mut executed = vec![];
        while let Some((name, directive)) = step(&f, &pipeline, &mut instance).await {
            executed.push(name);
            if instance.phase() == Some(Phase::Initialize) {
                break;
            }
            assert!(matches!(directive, Directive::StatusUpdate), "{directive:?}");
        }

        assert_eq!(f.client.count("PersistentVolumeClaim"), 0);
        assert_eq!(f.client.count("Deployment"), 2);
        assert!(!executed.contains(&"ensure database deployment".to_string()));

        // database readiness is not awaited
        make_available(&f, "ns", TRILLIAN_LOGSERVER_NAME).await;
        make_available(&f, "ns", TRILLIAN_LOGSIGNER_NAME).await;
        while instance.phase() != Some(Phase::Ready) {
            step(&f, &pipeline, &mut instance).await.unwrap();
        }
        assert_eq!(
            instance.status.as_ref().and_then(|s| s.url.as_deref()),
            Some("trillian-logserver.ns.svc:8091")
        );
    }
}
