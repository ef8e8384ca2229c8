//! # Error Recovery
//!
//! Rolls a failed resource back to `Pending` with a bounded budget.
//!
//! Every recovery replaces the status with a fresh one that keeps only the
//! fields the kind declares reuse-safe (see
//! [`ManagedResource::reset_status_for_recovery`]), so the next convergence
//! reuses trees, keys and configuration that were already issued instead of
//! acquiring duplicates.
//!
//! Once the counter reaches the budget the resource stays in `Failure`. The
//! counter only drops back to zero when the resource reaches `Ready`.

use super::{Action, ActionContext, Directive};
use crate::controller::events::reasons;
use crate::crd::{Condition, ManagedResource, Phase};
use crate::observability::metrics;
use async_trait::async_trait;
use kube::runtime::events::EventType;
use std::marker::PhantomData;
use tracing::warn;

pub const RESTARTED_MESSAGE: &str = "Restarted by error handler";
pub const THRESHOLD_MESSAGE: &str = "Restart threshold reached";

#[derive(Debug)]
pub struct ErrorRecovery<K> {
    allowed_restarts: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> ErrorRecovery<K> {
    pub fn new(allowed_restarts: u32) -> Self {
        Self {
            allowed_restarts,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: ManagedResource> Action<K> for ErrorRecovery<K> {
    fn name(&self) -> &str {
        "error handler"
    }

    fn can_handle(&self, instance: &K) -> bool {
        instance.phase() == Some(Phase::Failure) && instance.restarts() < self.allowed_restarts
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut K) -> Directive {
        let restarts = instance.restarts() + 1;
        instance.reset_status_for_recovery();
        instance.set_restarts(restarts);
        metrics::increment_recovery_restarts(K::COMPONENT);

        if restarts >= self.allowed_restarts {
            warn!(
                restarts,
                allowed = self.allowed_restarts,
                "{} reached its restart threshold",
                K::COMPONENT
            );
            instance.set_condition(Condition::ready(Phase::Failure).with_message(THRESHOLD_MESSAGE));
            ctx.event(
                instance,
                EventType::Warning,
                reasons::RESTART_THRESHOLD_REACHED,
                THRESHOLD_MESSAGE,
            )
            .await;
        } else {
            instance.set_condition(Condition::ready(Phase::Pending).with_message(RESTARTED_MESSAGE));
            ctx.event(
                instance,
                EventType::Warning,
                reasons::RESTARTED,
                format!("{RESTARTED_MESSAGE} ({restarts}/{})", self.allowed_restarts),
            )
            .await;
        }

        Directive::StatusUpdate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::action::ready_message;
    use crate::controller::action::testing::{fixture, rekor};
    use crate::crd::{
        ConditionStatus, ConditionsAware, Rekor, RekorSigner, SecretKeySelector,
        REKOR_SERVER_CONDITION, REKOR_SIGNER_CONDITION,
    };

    fn failed_rekor(restarts: u32) -> Rekor {
        let mut instance = rekor(Some(Phase::Failure));
        instance.set_restarts(restarts);
        let status = instance.status_mut();
        status.tree_id = Some(42);
        status.pvc_name = Some("rekor-pvc".to_string());
        status.url = Some("http://rekor-server.ns.svc".to_string());
        status.signer = Some(RekorSigner {
            key_ref: Some(SecretKeySelector::new("rekor-signer", "private")),
        });
        instance.set_condition(Condition::new(
            REKOR_SIGNER_CONDITION,
            ConditionStatus::True,
            Phase::Ready,
        ));
        instance.set_condition(Condition::new(
            REKOR_SERVER_CONDITION,
            ConditionStatus::False,
            Phase::Failure,
        ));
        instance
    }

    #[test]
    fn test_can_handle_only_failure_within_budget() {
        let recovery = ErrorRecovery::<Rekor>::new(3);
        assert!(recovery.can_handle(&failed_rekor(0)));
        assert!(recovery.can_handle(&failed_rekor(2)));
        assert!(!recovery.can_handle(&failed_rekor(3)));
        assert!(!recovery.can_handle(&rekor(Some(Phase::Creating))));
        assert!(!recovery.can_handle(&rekor(None)));
    }

    #[tokio::test]
    async fn test_recovery_resets_to_pending_and_keeps_reuse_safe_fields() {
        let f = fixture();
        let mut instance = failed_rekor(0);

        let directive = ErrorRecovery::<Rekor>::new(3).handle(&f.ctx, &mut instance).await;

        assert!(matches!(directive, Directive::StatusUpdate));
        assert_eq!(instance.phase(), Some(Phase::Pending));
        assert_eq!(ready_message(&instance), Some(RESTARTED_MESSAGE));
        assert_eq!(instance.restarts(), 1);

        let status = instance.status.as_ref().unwrap();
        assert_eq!(status.tree_id, Some(42));
        assert_eq!(status.pvc_name.as_deref(), Some("rekor-pvc"));
        assert!(status.signer.is_some());
        assert!(instance.is_condition_true(REKOR_SIGNER_CONDITION));
        // non reuse-safe state is dropped
        assert_eq!(status.url, None);
        assert!(instance.find_condition(REKOR_SERVER_CONDITION).is_none());

        let events = f.recorder.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].reason, reasons::RESTARTED);
    }

    #[tokio::test]
    async fn test_last_restart_is_terminal() {
        let f = fixture();
        let mut instance = failed_rekor(2);
        let recovery = ErrorRecovery::<Rekor>::new(3);

        recovery.handle(&f.ctx, &mut instance).await;

        assert_eq!(instance.restarts(), 3);
        assert_eq!(instance.phase(), Some(Phase::Failure));
        assert_eq!(ready_message(&instance), Some(THRESHOLD_MESSAGE));
        assert!(!recovery.can_handle(&instance));
        assert_eq!(f.recorder.reasons(), vec![reasons::RESTART_THRESHOLD_REACHED]);
    }

    #[tokio::test]
    async fn test_failed_signer_is_not_reused() {
        let f = fixture();
        let mut instance = failed_rekor(0);
        instance.set_condition(Condition::new(
            REKOR_SIGNER_CONDITION,
            ConditionStatus::False,
            Phase::Failure,
        ));

        ErrorRecovery::<Rekor>::new(3).handle(&f.ctx, &mut instance).await;

        assert!(instance.status.as_ref().unwrap().signer.is_none());
        assert_eq!(instance.status.as_ref().unwrap().tree_id, Some(42));
    }
}
