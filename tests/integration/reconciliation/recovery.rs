//! Error recovery: bounded restarts that reuse what was already issued

use super::{Harness, ScriptedTrees, ALLOWED_RESTARTS, NS};
use securesign_operator::controller::action::recovery::{RESTARTED_MESSAGE, THRESHOLD_MESSAGE};
use securesign_operator::controller::client::Operation;
use securesign_operator::controller::components::rekor;
use securesign_operator::controller::events::reasons;
use securesign_operator::controller::reconciler::PassOutcome;
use securesign_operator::crd::{
    Condition, ConditionsAware, ManagedResource, Phase, Rekor, RekorSpec, TreeIdentified,
};

/// Converge a Rekor, then mark it failed with `restarts` recoveries spent
async fn failed_after_convergence(h: &Harness, trees: &std::sync::Arc<ScriptedTrees>, restarts: u32) {
    h.create_log_server_service().await;
    let mut instance = Rekor::new("rekor", RekorSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(rekor::pipeline(trees.clone(), &h.config));
    h.converge(&reconciler, "rekor").await;

    let mut failed: Rekor = h.fetch("rekor").await;
    failed.set_condition(Condition::ready(Phase::Failure).with_message("log server crashed"));
    failed.set_restarts(restarts);
    h.write_status::<Rekor>("rekor", serde_json::to_value(&failed.status).unwrap())
        .await;
}

#[tokio::test]
async fn test_recovery_reuses_tree_and_signer() {
    let h = Harness::new();
    let trees = ScriptedTrees::fixed(7);
    failed_after_convergence(&h, &trees, ALLOWED_RESTARTS - 2).await;
    let signer_creates = h.client.calls("Secret", Operation::Create);
    let reconciler = h.reconciler(rekor::pipeline(trees.clone(), &h.config));

    assert_eq!(reconciler.reconcile(NS, "rekor").await.unwrap(), PassOutcome::RequeueNow);
    let restarted: Rekor = h.fetch("rekor").await;
    assert_eq!(restarted.phase(), Some(Phase::Pending));
    assert_eq!(restarted.restarts(), ALLOWED_RESTARTS - 1);
    assert_eq!(
        restarted.find_condition("Ready").and_then(|c| c.message.as_deref()),
        Some(RESTARTED_MESSAGE)
    );
    assert!(h.recorder.reasons().contains(&reasons::RESTARTED.to_string()));

    let phases = h.converge(&reconciler, "rekor").await;

    assert_eq!(
        phases,
        vec![Phase::Pending, Phase::Creating, Phase::Initialize, Phase::Ready]
    );
    let recovered: Rekor = h.fetch("rekor").await;
    assert_eq!(recovered.status_tree_id(), Some(7));
    assert_eq!(recovered.restarts(), 0);
    assert_eq!(trees.calls(), 1);
    assert_eq!(h.client.calls("Secret", Operation::Create), signer_creates);
}

#[tokio::test]
async fn test_restart_budget_exhaustion_is_terminal() {
    let h = Harness::new();
    let trees = ScriptedTrees::fixed(7);
    failed_after_convergence(&h, &trees, ALLOWED_RESTARTS - 1).await;
    let reconciler = h.reconciler(rekor::pipeline(trees.clone(), &h.config));

    reconciler.reconcile(NS, "rekor").await.unwrap();
    let exhausted: Rekor = h.fetch("rekor").await;
    assert_eq!(exhausted.phase(), Some(Phase::Failure));
    assert_eq!(exhausted.restarts(), ALLOWED_RESTARTS);
    assert_eq!(
        exhausted.find_condition("Ready").and_then(|c| c.message.as_deref()),
        Some(THRESHOLD_MESSAGE)
    );
    assert!(h
        .recorder
        .reasons()
        .contains(&reasons::RESTART_THRESHOLD_REACHED.to_string()));

    let status_writes = h.client.calls("Rekor", Operation::UpdateStatus);
    for _ in 0..3 {
        assert_eq!(reconciler.reconcile(NS, "rekor").await.unwrap(), PassOutcome::Done);
    }
    assert_eq!(h.client.calls("Rekor", Operation::UpdateStatus), status_writes);
    assert_eq!(h.fetch::<Rekor>("rekor").await.phase(), Some(Phase::Failure));
}
