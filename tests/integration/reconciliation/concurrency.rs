//! Passes over the same resource never act on a stale copy

use super::{Harness, ScriptedTrees, NS};
use securesign_operator::controller::client::{InjectedFailure, Operation};
use securesign_operator::controller::components::rekor;
use securesign_operator::controller::reconciler::{persist_status, PassOutcome, ReconcilerError};
use securesign_operator::crd::{Condition, ConditionsAware, Phase, Rekor, RekorSpec};

fn seed_rekor(h: &Harness) {
    let mut instance = Rekor::new("rekor", RekorSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
}

#[tokio::test]
async fn test_back_to_back_passes_build_on_each_other() {
    let h = Harness::new();
    seed_rekor(&h);
    let reconciler = h.reconciler(rekor::pipeline(ScriptedTrees::fixed(1), &h.config));

    let (first, second) = tokio::join!(
        reconciler.reconcile(NS, "rekor"),
        reconciler.reconcile(NS, "rekor")
    );

    // every pass that wrote did so against the version it read
    let results = [first, second];
    let written = results
        .iter()
        .filter(|r| matches!(r, Ok(PassOutcome::RequeueNow)))
        .count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(ReconcilerError::Conflict(_))))
        .count();
    assert!(results
        .iter()
        .all(|r| matches!(r, Ok(_) | Err(ReconcilerError::Conflict(_)))));
    assert!(written >= 1);
    assert_eq!(
        h.client.calls("Rekor", Operation::UpdateStatus),
        written + conflicts
    );
    assert!(h.fetch::<Rekor>("rekor").await.phase().is_some());
}

#[tokio::test]
async fn test_stale_copy_cannot_overwrite_newer_status() {
    let h = Harness::new();
    seed_rekor(&h);
    let reconciler = h.reconciler(rekor::pipeline(ScriptedTrees::fixed(1), &h.config));
    let stale: Rekor = h.fetch("rekor").await;

    reconciler.reconcile(NS, "rekor").await.unwrap();

    let mut working = stale.clone();
    working.set_condition(Condition::ready(Phase::Creating));
    let error = persist_status(h.client.as_ref(), &stale, &working)
        .await
        .unwrap_err();
    assert!(error.is_conflict());
    assert_eq!(h.fetch::<Rekor>("rekor").await.phase(), Some(Phase::Pending));
}

#[tokio::test]
async fn test_conflicting_write_is_retried_from_a_fresh_read() {
    let h = Harness::new();
    seed_rekor(&h);
    let reconciler = h.reconciler(rekor::pipeline(ScriptedTrees::fixed(1), &h.config));
    h.client
        .fail_next("Rekor", Operation::UpdateStatus, InjectedFailure::Conflict);

    let error = reconciler.reconcile(NS, "rekor").await.unwrap_err();
    assert!(matches!(error, ReconcilerError::Conflict(_)));
    assert!(error.is_retryable());
    assert_eq!(h.fetch::<Rekor>("rekor").await.phase(), None);

    assert_eq!(reconciler.reconcile(NS, "rekor").await.unwrap(), PassOutcome::RequeueNow);
    assert_eq!(h.fetch::<Rekor>("rekor").await.phase(), Some(Phase::Pending));
}
