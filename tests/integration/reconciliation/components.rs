//! Convergence of the Trillian, CTlog, Rekor, TUF and timestamp authority
//! pipelines, and their
//! reaction to inputs that change after `Ready`

use super::{Harness, ScriptedTrees, NS};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use securesign_operator::controller::action::resolve_tree::log_server_address;
use securesign_operator::controller::client::{get_typed, Operation};
use securesign_operator::controller::components::{ctlog, rekor, trillian, tsa, tuf};
use securesign_operator::controller::kubernetes::secret_value;
use securesign_operator::crd::{
    CTlog, CTlogSpec, ConditionsAware, LocalObjectReference, Phase, Rekor, RekorSpec,
    SecretKeySelector, TimestampAuthority, TimestampAuthoritySpec, TreeIdentified, Trillian,
    TrillianSpec, Tuf, TufSpec, CTLOG_SERVER_CONFIG_CONDITION, REKOR_SIGNER_CONDITION,
    TSA_SIGNER_CONDITION, TUF_REPOSITORY_CONDITION,
};

#[tokio::test]
async fn test_trillian_with_managed_database_converges() {
    let h = Harness::new();
    let mut instance = Trillian::new("trillian", TrillianSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(trillian::pipeline());

    let phases = h.converge(&reconciler, "trillian").await;

    assert_eq!(phases.last(), Some(&Phase::Ready));
    let converged: Trillian = h.fetch("trillian").await;
    assert_eq!(
        converged.status.as_ref().and_then(|s| s.url.clone()),
        Some(log_server_address(NS))
    );
    assert_eq!(h.client.count("Deployment"), 3);
    assert_eq!(h.client.count("Service"), 2);

    let credentials: Secret = get_typed(h.client.as_ref(), NS, &trillian::db_secret_name(&converged))
        .await
        .unwrap();
    for key in trillian::DB_SECRET_KEYS {
        assert!(secret_value(&credentials, key).is_some(), "missing {key}");
    }
}

#[tokio::test]
async fn test_trillian_with_external_database_creates_no_database() {
    let h = Harness::new();
    let mut spec = TrillianSpec::default();
    spec.database.create = false;
    spec.database.database_secret_ref = Some(LocalObjectReference {
        name: "external-mysql".to_string(),
    });
    let mut instance = Trillian::new("trillian", spec);
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(trillian::pipeline());

    h.converge(&reconciler, "trillian").await;

    assert_eq!(h.client.count("Deployment"), 2);
    assert_eq!(h.client.calls("Secret", Operation::Create), 0);
}

#[tokio::test]
async fn test_ctlog_renders_config_for_its_tree() {
    let h = Harness::new();
    h.create_log_server_service().await;
    h.create_trust_secret("fulcio-root", ctlog::FULCIO_CERT_FILE).await;
    let trees = ScriptedTrees::fixed(314);
    let mut instance = CTlog::new("ctlog", CTlogSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(ctlog::pipeline(trees.clone(), &h.config));

    h.converge(&reconciler, "ctlog").await;

    let converged: CTlog = h.fetch("ctlog").await;
    assert_eq!(converged.status_tree_id(), Some(314));
    assert!(converged.is_condition_true(CTLOG_SERVER_CONFIG_CONDITION));
    let status = converged.status_ref().unwrap();
    assert_eq!(status.root_certificates.len(), 1);
    assert_eq!(status.root_certificates[0].name, "fulcio-root");

    let config: Secret = get_typed(h.client.as_ref(), NS, &ctlog::config_secret_name(&converged))
        .await
        .unwrap();
    assert_eq!(
        secret_value(&config, "config"),
        Some(ctlog::render_config(NS, 314, &status.root_certificates))
    );
    assert_eq!(trees.calls(), 1);
}

#[tokio::test]
async fn test_ctlog_waits_for_fulcio_roots() {
    let h = Harness::new();
    h.create_log_server_service().await;
    let mut instance = CTlog::new("ctlog", CTlogSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(ctlog::pipeline(ScriptedTrees::fixed(1), &h.config));

    for _ in 0..10 {
        reconciler.reconcile(NS, "ctlog").await.unwrap();
    }
    assert_eq!(h.fetch::<CTlog>("ctlog").await.phase(), Some(Phase::Creating));

    h.create_trust_secret("fulcio-root", ctlog::FULCIO_CERT_FILE).await;
    let phases = h.converge(&reconciler, "ctlog").await;
    assert_eq!(phases.last(), Some(&Phase::Ready));
}

#[tokio::test]
async fn test_tuf_initializes_repository_from_labelled_keys() {
    let h = Harness::new();
    for (secret, file) in [
        ("rekor-pub", "rekor.pub"),
        ("ctlog-pub", "ctfe.pub"),
        ("fulcio-cert", "fulcio_v1.crt.pem"),
        ("tsa-chain", "tsa.certchain.pem"),
    ] {
        h.create_trust_secret(secret, file).await;
    }
    let mut instance = Tuf::new("tuf", TufSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(tuf::pipeline());

    h.converge(&reconciler, "tuf").await;

    let converged: Tuf = h.fetch("tuf").await;
    assert!(converged.is_condition_true(TUF_REPOSITORY_CONDITION));
    let keys = &converged.status.as_ref().unwrap().keys;
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|k| k.secret_ref.is_some()));
    assert_eq!(h.client.count("Job"), 1);
}

#[tokio::test]
async fn test_rekor_picks_up_signer_injected_after_ready() {
    let h = Harness::new();
    h.create_log_server_service().await;
    let mut instance = Rekor::new("rekor", RekorSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(rekor::pipeline(ScriptedTrees::fixed(9), &h.config));
    h.converge(&reconciler, "rekor").await;
    assert_eq!(h.client.calls("Deployment", Operation::Update), 0);

    let injected = SecretKeySelector::new("injected-signer", "private");
    let wanted = injected.clone();
    h.edit::<Rekor>("rekor", move |r| r.spec.signer.key_ref = Some(wanted))
        .await;
    let phases = h.converge(&reconciler, "rekor").await;

    assert_eq!(phases, vec![Phase::Ready]);
    let converged: Rekor = h.fetch("rekor").await;
    assert_eq!(converged.signer_key_ref(), Some(&injected));
    assert_eq!(converged.status_tree_id(), Some(9));
    assert_eq!(
        converged
            .find_condition(REKOR_SIGNER_CONDITION)
            .and_then(|c| c.message.as_deref()),
        Some("Signer changed")
    );

    let deployment: Deployment = get_typed(h.client.as_ref(), NS, rekor::DEPLOYMENT_NAME)
        .await
        .unwrap();
    let volumes = deployment.spec.unwrap().template.spec.unwrap().volumes.unwrap();
    let signer_secrets: Vec<_> = volumes
        .iter()
        .filter_map(|v| v.secret.as_ref()?.secret_name.clone())
        .collect();
    assert_eq!(signer_secrets, vec!["injected-signer".to_string()]);
    assert_eq!(h.client.calls("Deployment", Operation::Update), 1);
}

#[tokio::test]
async fn test_tuf_follows_rotated_key_secret() {
    let h = Harness::new();
    for (secret, file) in [
        ("rekor-pub", "rekor.pub"),
        ("ctlog-pub", "ctfe.pub"),
        ("fulcio-cert", "fulcio_v1.crt.pem"),
        ("tsa-chain", "tsa.certchain.pem"),
    ] {
        h.create_trust_secret(secret, file).await;
    }
    let mut instance = Tuf::new("tuf", TufSpec::default());
    instance.metadata.namespace = Some(NS.to_string());
    h.seed(&instance);
    let reconciler = h.reconciler(tuf::pipeline());
    h.converge(&reconciler, "tuf").await;
    assert!(h.fetch::<Tuf>("tuf").await.is_condition_true("ctfe.pub"));

    h.delete_secret("ctlog-pub").await;
    assert_eq!(h.run_passes(&reconciler, "tuf", 5).await, Some(Phase::Pending));
    let waiting: Tuf = h.fetch("tuf").await;
    assert!(!waiting.is_condition_true("ctfe.pub"));
    assert!(waiting.is_condition_true("rekor.pub"));
    assert!(waiting.find_condition(TUF_REPOSITORY_CONDITION).is_none());

    h.create_trust_secret("aaa-ctlog-update", "ctfe.pub").await;
    let phases = h.converge(&reconciler, "tuf").await;

    assert_eq!(
        phases,
        vec![Phase::Pending, Phase::Creating, Phase::Initialize, Phase::Ready]
    );
    let converged: Tuf = h.fetch("tuf").await;
    assert!(converged.is_condition_true("ctfe.pub"));
    assert!(converged.is_condition_true(TUF_REPOSITORY_CONDITION));
    let sources: Vec<&str> = converged
        .resolved_keys()
        .iter()
        .filter_map(|k| k.secret_ref.as_ref().map(|r| r.name.as_str()))
        .collect();
    assert_eq!(sources, vec!["rekor-pub", "aaa-ctlog-update", "fulcio-cert", "tsa-chain"]);

    // the repository was seeded again and the server rolled
    assert_eq!(h.client.calls("Job", Operation::Create), 2);
    assert_eq!(h.client.count("Job"), 1);
    let deployment: Deployment = get_typed(h.client.as_ref(), NS, tuf::DEPLOYMENT_NAME)
        .await
        .unwrap();
    let annotations = deployment
        .spec
        .unwrap()
        .template
        .metadata
        .unwrap()
        .annotations
        .unwrap();
    assert!(annotations[tuf::TRUSTED_KEYS_ANNOTATION].contains("ctfe.pub=aaa-ctlog-update/value"));
}

#[tokio::test]
async fn test_timestamp_authority_chain_feeds_tuf() {
    let h = Harness::new();
    let mut authority = TimestampAuthority::new("tsa", TimestampAuthoritySpec::default());
    authority.metadata.namespace = Some(NS.to_string());
    h.seed(&authority);
    let reconciler = h.reconciler(tsa::pipeline());

    let phases = h.converge(&reconciler, "tsa").await;

    assert_eq!(
        phases,
        vec![Phase::Pending, Phase::Creating, Phase::Initialize, Phase::Ready]
    );
    let converged: TimestampAuthority = h.fetch("tsa").await;
    assert!(converged.is_condition_true(TSA_SIGNER_CONDITION));
    assert_eq!(
        converged.status.as_ref().and_then(|s| s.url.as_deref()),
        Some("http://tsa-server.securesign.svc")
    );
    let chain: Secret = get_typed(h.client.as_ref(), NS, &tsa::signer_secret_name(&converged))
        .await
        .unwrap();
    assert_eq!(
        secret_value(&chain, "certificateChain")
            .unwrap()
            .matches("-----BEGIN CERTIFICATE-----")
            .count(),
        3
    );

    for (secret, file) in [
        ("rekor-pub", "rekor.pub"),
        ("ctlog-pub", "ctfe.pub"),
        ("fulcio-cert", "fulcio_v1.crt.pem"),
    ] {
        h.create_trust_secret(secret, file).await;
    }
    let mut repository = Tuf::new("tuf", TufSpec::default());
    repository.metadata.namespace = Some(NS.to_string());
    h.seed(&repository);
    h.converge(&h.reconciler(tuf::pipeline()), "tuf").await;

    let repository: Tuf = h.fetch("tuf").await;
    let chain_source = repository
        .resolved_keys()
        .iter()
        .find(|k| k.name == tsa::CHAIN_FILE)
        .and_then(|k| k.secret_ref.clone());
    assert_eq!(
        chain_source,
        Some(SecretKeySelector::new("tsa-signer-tsa", "certificateChain"))
    );
}
