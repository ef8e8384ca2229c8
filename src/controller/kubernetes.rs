//! # Kubernetes Objects
//!
//! Builders for the child workloads the operator manages, and readiness
//! checks over their observed status.
//!
//! Builders only fill the fields the operator owns so the result can be used
//! directly as the desired state of [`crate::controller::action::ensure`].

use crate::constants::LABEL_NAMESPACE;
use crate::crd::Pvc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Secret, SecretKeySelector, Service,
    ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub const PART_OF: &str = "trusted-artifact-signer";
pub const MANAGED_BY: &str = "securesign-operator";

/// Standard labels for a child object of `instance`
pub fn labels_for(component: &str, name: &str, instance: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(component, name, instance);
    labels.insert("app.kubernetes.io/part-of".to_string(), PART_OF.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels
}

/// Subset of [`labels_for`] that is stable enough for pod selectors
pub fn selector_labels(component: &str, name: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/component".to_string(), component.to_string()),
        ("app.kubernetes.io/name".to_string(), name.to_string()),
        ("app.kubernetes.io/instance".to_string(), instance.to_string()),
    ])
}

/// Label under which a Secret advertises a well-known trust file
/// (e.g. `rhtas.redhat.com/fulcio_v1.crt.pem`); its value is the data key
pub fn trust_label(file_name: &str) -> String {
    format!("{LABEL_NAMESPACE}/{file_name}")
}

fn meta(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..ObjectMeta::default()
    }
}

pub fn container(name: &str, image: &str, args: Vec<String>, ports: &[(&str, i32)]) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        args: (!args.is_empty()).then_some(args),
        ports: (!ports.is_empty()).then(|| {
            ports
                .iter()
                .map(|(port_name, port)| ContainerPort {
                    name: Some((*port_name).to_string()),
                    container_port: *port,
                    ..ContainerPort::default()
                })
                .collect()
        }),
        ..Container::default()
    }
}

/// Environment variable read from a Secret key
pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

pub fn deployment(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
    pod: PodSpec,
) -> Deployment {
    Deployment {
        metadata: meta(name, namespace, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..ObjectMeta::default()
                }),
                spec: Some(pod),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

pub fn service(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
    ports: &[(&str, i32)],
) -> Service {
    Service {
        metadata: meta(name, namespace, labels),
        spec: Some(ServiceSpec {
            selector: Some(selector.clone()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some((*port_name).to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*port)),
                        ..ServicePort::default()
                    })
                    .collect(),
            ),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub fn secret(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    data: BTreeMap<String, Vec<u8>>,
) -> Secret {
    Secret {
        metadata: meta(name, namespace, labels),
        data: Some(
            data.into_iter()
                .map(|(key, value)| (key, ByteString(value)))
                .collect(),
        ),
        ..Secret::default()
    }
}

pub fn persistent_volume_claim(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    pvc: &Pvc,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(name, namespace, labels),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: pvc.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(pvc.size.clone()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

pub fn job(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    mut pod: PodSpec,
) -> Job {
    pod.restart_policy = Some("Never".to_string());
    Job {
        metadata: meta(name, namespace, labels),
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..ObjectMeta::default()
                }),
                spec: Some(pod),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// Whether every desired replica of the Deployment is available
pub fn deployment_is_available(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let available = status
        .conditions
        .as_ref()
        .and_then(|c| c.iter().find(|c| c.type_ == "Available"))
        .is_some_and(|c| c.status == "True");
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    available && status.ready_replicas.unwrap_or(0) >= desired
}

/// Observed state of a Job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

pub fn job_state(job: &Job) -> JobState {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    let is_true = |type_: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    };

    if is_true("Failed") {
        JobState::Failed
    } else if is_true("Complete") {
        JobState::Succeeded
    } else {
        JobState::Running
    }
}

/// Read a key of a Secret as UTF-8
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    #[test]
    fn test_labels_include_selector_labels() {
        let labels = labels_for("ctlog", "ctlog", "my-ctlog");
        let selector = selector_labels("ctlog", "ctlog", "my-ctlog");
        for (k, v) in &selector {
            assert_eq!(labels.get(k), Some(v));
        }
        assert_eq!(labels["app.kubernetes.io/part-of"], PART_OF);
    }

    #[test]
    fn test_deployment_availability() {
        let mut dp = deployment(
            "rekor-server",
            "ns",
            &BTreeMap::new(),
            &BTreeMap::new(),
            PodSpec::default(),
        );
        assert!(!deployment_is_available(&dp));

        dp.status = Some(DeploymentStatus {
            ready_replicas: Some(1),
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "True".to_string(),
                ..DeploymentCondition::default()
            }]),
            ..DeploymentStatus::default()
        });
        assert!(deployment_is_available(&dp));
    }

    #[test]
    fn test_job_state() {
        let mut tuf_init = job("tuf-repository-init", "ns", &BTreeMap::new(), PodSpec::default());
        assert_eq!(job_state(&tuf_init), JobState::Running);

        tuf_init.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..JobCondition::default()
            }]),
            ..JobStatus::default()
        });
        assert_eq!(job_state(&tuf_init), JobState::Failed);
    }

    #[test]
    fn test_secret_value_roundtrip() {
        let s = secret(
            "keys",
            "ns",
            &BTreeMap::new(),
            BTreeMap::from([("public".to_string(), b"pem".to_vec())]),
        );
        assert_eq!(secret_value(&s, "public").as_deref(), Some("pem"));
        assert_eq!(secret_value(&s, "private"), None);
    }
}
