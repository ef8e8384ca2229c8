//! # Naming and Labelling Unit Tests
//!
//! These tests verify:
//! - Labels stamped on child objects
//! - Trust labels used to discover key material
//! - Label selector matching of the in-memory cluster
//! - Names of generated objects

use securesign_operator::controller::client::matches_selector;
use securesign_operator::controller::components::{ctlog, rekor, trillian, tsa, tuf};
use securesign_operator::controller::kubernetes::{labels_for, selector_labels, trust_label};
use securesign_operator::crd::{
    CTlog, CTlogSpec, Rekor, RekorSpec, TimestampAuthority, TimestampAuthoritySpec, Trillian,
    TrillianSpec, Tuf, TufSpec,
};

#[test]
fn test_labels_for_extends_selector_labels() {
    let labels = labels_for("rekor", "rekor-server", "prod");
    let selector = selector_labels("rekor", "rekor-server", "prod");

    assert!(selector.iter().all(|(k, v)| labels.get(k) == Some(v)));
    assert_eq!(
        labels.get("app.kubernetes.io/managed-by").map(String::as_str),
        Some("securesign-operator")
    );
    assert_eq!(labels.len(), selector.len() + 2);
}

#[test]
fn test_trust_label_is_namespaced() {
    assert_eq!(trust_label("ctfe.pub"), "rhtas.redhat.com/ctfe.pub");
}

#[test]
fn test_matches_selector_terms() {
    let labels = labels_for("ctlog", "ctlog", "a");

    assert!(matches_selector(&labels, "app.kubernetes.io/instance=a"));
    assert!(matches_selector(&labels, "app.kubernetes.io/instance==a,app.kubernetes.io/name"));
    assert!(matches_selector(&labels, "app.kubernetes.io/instance!=b"));
    assert!(matches_selector(&labels, "!rhtas.redhat.com/ctfe.pub"));
    assert!(!matches_selector(&labels, "rhtas.redhat.com/ctfe.pub"));
    assert!(matches_selector(&labels, ""));
}

#[test]
fn test_generated_object_names() {
    assert_eq!(
        trillian::db_secret_name(&Trillian::new("t", TrillianSpec::default())),
        "trillian-mysql-t"
    );
    assert_eq!(
        trillian::db_pvc_name(&Trillian::new("t", TrillianSpec::default())),
        "trillian-mysql-t-pvc"
    );
    let ctlog = CTlog::new("c", CTlogSpec::default());
    assert_eq!(ctlog::keys_secret_name(&ctlog), "ctlog-keys-c");
    assert_eq!(ctlog::config_secret_name(&ctlog), "ctlog-config-c");
    let rekor = Rekor::new("r", RekorSpec::default());
    assert_eq!(rekor::signer_secret_name(&rekor), "rekor-signer-r");
    assert_eq!(rekor::pvc_name(&rekor), "rekor-r-pvc");
    assert_eq!(tuf::init_job_name(&Tuf::new("u", TufSpec::default())), "tuf-repository-init-u");
    let tsa = TimestampAuthority::new("s", TimestampAuthoritySpec::default());
    assert_eq!(tsa::signer_secret_name(&tsa), "tsa-signer-s");
    assert_eq!(tsa::config_secret_name(&tsa), "tsa-server-config-s");
}

#[test]
fn test_rekor_url_points_at_service() {
    assert_eq!(rekor::server_url("ns"), "http://rekor-server.ns.svc");
    assert_eq!(tsa::server_url("ns"), "http://tsa-server.ns.svc");
}
