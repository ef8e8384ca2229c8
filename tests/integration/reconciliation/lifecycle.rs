//! Lifecycle of a Rekor resource from creation to `Ready`

use super::{Harness, ScriptedTrees, NS};
use securesign_operator::controller::client::Operation;
use securesign_operator::controller::components::rekor;
use securesign_operator::controller::events::reasons;
use securesign_operator::controller::reconciler::{PassOutcome, ReconcilerError};
use securesign_operator::controller::tree::TreeError;
use securesign_operator::crd::{
    ConditionsAware, Phase, Rekor, RekorSpec, TreeIdentified, REKOR_SERVER_CONDITION,
};
use std::time::Duration;

fn new_rekor() -> Rekor {
    let mut instance = Rekor::new("rekor", RekorSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    instance
}

#[tokio::test]
async fn test_new_resource_walks_every_phase_to_ready() {
    let h = Harness::new();
    h.create_log_server_service().await;
    let trees = ScriptedTrees::fixed(1001);
    let reconciler = h.reconciler(rekor::pipeline(trees.clone(), &h.config));
    h.seed(&new_rekor());

    // first pass only stamps Pending, second only moves to Creating
    assert_eq!(reconciler.reconcile(NS, "rekor").await.unwrap(), PassOutcome::RequeueNow);
    assert_eq!(h.fetch::<Rekor>("rekor").await.phase(), Some(Phase::Pending));
    let phases = h.converge(&reconciler, "rekor").await;

    assert_eq!(
        phases,
        vec![Phase::Pending, Phase::Creating, Phase::Initialize, Phase::Ready]
    );
    let converged: Rekor = h.fetch("rekor").await;
    assert_eq!(converged.status_tree_id(), Some(1001));
    assert!(converged.is_condition_true(REKOR_SERVER_CONDITION));
    assert_eq!(
        converged.status.as_ref().and_then(|s| s.url.as_deref()),
        Some("http://rekor-server.securesign.svc")
    );
    assert_eq!(trees.calls(), 1);
    assert_eq!(h.client.count("Deployment"), 1);
    assert!(h.recorder.reasons().contains(&reasons::TREE_CREATED.to_string()));
}

#[tokio::test]
async fn test_converged_resource_issues_no_writes() {
    let h = Harness::new();
    h.create_log_server_service().await;
    let reconciler = h.reconciler(rekor::pipeline(ScriptedTrees::fixed(7), &h.config));
    h.seed(&new_rekor());
    h.converge(&reconciler, "rekor").await;

    let writes = |h: &Harness| {
        ["Deployment", "Service", "Secret", "PersistentVolumeClaim", "Rekor"]
            .iter()
            .map(|kind| {
                h.client.calls(kind, Operation::Create)
                    + h.client.calls(kind, Operation::Update)
                    + h.client.calls(kind, Operation::UpdateStatus)
            })
            .sum::<usize>()
    };
    let before = writes(&h);

    for _ in 0..3 {
        assert_eq!(reconciler.reconcile(NS, "rekor").await.unwrap(), PassOutcome::Done);
    }

    assert_eq!(writes(&h), before);
}

#[tokio::test]
async fn test_tree_timeout_leaves_status_untouched_until_retry_succeeds() {
    let h = Harness::new();
    h.create_log_server_service().await;
    let trees = ScriptedTrees::scripted(
        55,
        vec![Err(TreeError::Timeout(Duration::from_secs(30)))],
    );
    let reconciler = h.reconciler(rekor::pipeline(trees.clone(), &h.config));
    h.seed(&new_rekor());

    let mut failure = None;
    for _ in 0..10 {
        if let Err(e) = reconciler.reconcile(NS, "rekor").await {
            failure = Some(e);
            break;
        }
    }
    let failure = failure.expect("tree creation should have failed once");
    assert!(matches!(failure, ReconcilerError::Action { ref action, .. } if action == "resolve treeID"));
    assert!(failure.is_retryable());

    let stalled: Rekor = h.fetch("rekor").await;
    assert_eq!(stalled.phase(), Some(Phase::Creating));
    assert_eq!(stalled.status_tree_id(), None);

    let phases = h.converge(&reconciler, "rekor").await;
    assert!(!phases.contains(&Phase::Failure));
    assert_eq!(h.fetch::<Rekor>("rekor").await.status_tree_id(), Some(55));
    assert_eq!(trees.calls(), 2);
}

#[tokio::test]
async fn test_pinned_tree_id_is_copied_without_creating_a_tree() {
    let h = Harness::new();
    h.create_log_server_service().await;
    let trees = ScriptedTrees::fixed(1);
    let reconciler = h.reconciler(rekor::pipeline(trees.clone(), &h.config));
    let mut instance = new_rekor();
    instance.spec.tree_id = Some(4242);
    h.seed(&instance);

    h.converge(&reconciler, "rekor").await;

    assert_eq!(h.fetch::<Rekor>("rekor").await.status_tree_id(), Some(4242));
    assert_eq!(trees.calls(), 0);
}

#[tokio::test]
async fn test_missing_log_server_requeues_in_creating() {
    let h = Harness::new();
    let trees = ScriptedTrees::fixed(1);
    let reconciler = h.reconciler(rekor::pipeline(trees.clone(), &h.config));
    h.seed(&new_rekor());

    let mut outcome = PassOutcome::Done;
    for _ in 0..10 {
        outcome = reconciler.reconcile(NS, "rekor").await.unwrap();
        if matches!(outcome, PassOutcome::RequeueAfter(_)) {
            break;
        }
    }

    assert_eq!(outcome, PassOutcome::RequeueAfter(Duration::from_secs(10)));
    assert_eq!(h.fetch::<Rekor>("rekor").await.phase(), Some(Phase::Creating));
    assert_eq!(trees.calls(), 0);
}
