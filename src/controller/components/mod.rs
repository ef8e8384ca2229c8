//! # Components
//!
//! One pipeline per managed kind. Pipelines are plain values assembled at
//! start-up and handed to a [`crate::controller::reconciler::Reconciler`].
//!
//! Every pipeline follows the same outline:
//!
//! 1. `∅ → Pending`
//! 2. `Pending` work (dependency checks, key material)
//! 3. `Pending → Creating`
//! 4. child objects, ensured in `Creating` and re-checked in `Ready`
//! 5. `Creating → Initialize`
//! 6. deployment readiness
//! 7. `Initialize → Ready`
//!
//! Error recovery is not part of the pipelines; the engine evaluates it
//! ahead of every pipeline.

pub mod ctlog;
pub mod rekor;
pub mod trillian;
pub mod tsa;
pub mod tuf;

use crate::controller::action::{error_or_failed, in_phase, Action, ActionContext, ActionError, Directive};
use crate::controller::client::get_opt;
use crate::controller::kubernetes::{labels_for, selector_labels};
use crate::crd::{name_of, namespace_of, Condition, ManagedResource, Phase};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimVolumeSource, SecretVolumeSource, Service, Volume, VolumeMount,
};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::info;

/// Phases in which child objects are ensured
pub fn creating_or_ready<K: ManagedResource>(instance: &K) -> bool {
    in_phase(instance, &[Phase::Creating, Phase::Ready])
}

/// Set `condition` unless an identical one is already present
///
/// Returns whether the status changed.
pub fn replace_condition<K: ManagedResource>(instance: &mut K, condition: Condition) -> bool {
    let unchanged = instance.find_condition(&condition.r#type).is_some_and(|c| {
        c.status == condition.status && c.reason == condition.reason && c.message == condition.message
    });
    if !unchanged {
        instance.set_condition(condition);
    }
    !unchanged
}

/// Labels of a child object of `instance` playing `name` in `component`
pub fn child_labels<K: ManagedResource>(instance: &K, name: &str) -> BTreeMap<String, String> {
    labels_for(K::COMPONENT, name, &name_of(instance))
}

pub fn child_selector<K: ManagedResource>(instance: &K, name: &str) -> BTreeMap<String, String> {
    selector_labels(K::COMPONENT, name, &name_of(instance))
}

/// Volume and mount for a Secret, read-only
pub fn secret_volume(name: &str, secret: &str, mount_path: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        },
    )
}

/// Volume and mount for a PersistentVolumeClaim
pub fn pvc_volume(name: &str, claim: &str, mount_path: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: None,
            }),
            ..Volume::default()
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            ..VolumeMount::default()
        },
    )
}

/// Holds a resource in `Pending` until a Service it depends on exists
pub struct AwaitService<K> {
    name: String,
    service: &'static str,
    _kind: PhantomData<fn() -> K>,
}

impl<K> std::fmt::Debug for AwaitService<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwaitService")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl<K> AwaitService<K> {
    pub fn new(service: &'static str) -> Self {
        Self {
            name: format!("wait for {service} service"),
            service,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: ManagedResource> Action<K> for AwaitService<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, instance: &K) -> bool {
        instance.phase() == Some(Phase::Pending)
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut K) -> Directive {
        match get_opt::<Service>(ctx.client(), &namespace_of(instance), self.service).await {
            Ok(Some(_)) => Directive::Continue,
            Ok(None) => {
                info!(service = self.service, "Waiting for dependency");
                ctx.wait_for_dependency()
            }
            Err(e) => error_or_failed(instance, ActionError::Client(e)),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::create_service;
    use super::*;
    use crate::controller::action::testing::{fixture, rekor};
    use crate::crd::{ConditionStatus, Rekor};

    #[tokio::test]
    async fn test_await_service_requeues_until_present() {
        let f = fixture();
        let action = AwaitService::<Rekor>::new("trillian-logserver");
        let mut instance = rekor(Some(Phase::Pending));

        assert!(matches!(action.handle(&f.ctx, &mut instance).await, Directive::Requeue(_)));

        create_service(&f, "ns", "trillian-logserver").await;
        assert!(action.handle(&f.ctx, &mut instance).await.is_continue());
    }

    #[test]
    fn test_replace_condition_reports_changes_only() {
        let mut instance = rekor(Some(Phase::Ready));
        let condition = Condition::new("rekor.pub", ConditionStatus::True, Phase::Ready);

        assert!(replace_condition(&mut instance, condition.clone()));
        assert!(!replace_condition(&mut instance, condition.clone()));
        assert!(replace_condition(&mut instance, condition.with_message("rotated")));
    }

    #[test]
    fn test_secret_volume_is_read_only() {
        let (volume, mount) = secret_volume("keys", "ctlog-keys", "/keys");
        assert_eq!(volume.secret.unwrap().secret_name.as_deref(), Some("ctlog-keys"));
        assert_eq!(mount.read_only, Some(true));
    }
}
