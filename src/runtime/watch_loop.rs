//! # Watch Loop
//!
//! One kube-runtime controller per managed kind, each owning the child
//! objects its pipeline creates, all driven concurrently until shutdown.

use crate::constants::{LABEL_NAMESPACE, WATCH_TIMEOUT_SECS};
use crate::controller::components::ctlog::FULCIO_CERT_FILE;
use crate::controller::kubernetes::trust_label;
use crate::controller::reconciler::{reconcile, Reconciler};
use crate::crd::{CTlog, ManagedResource, Rekor, TimestampAuthority, Trillian, Tuf};
use crate::runtime::error_policy::{handle_reconciliation_error, log_watch_error};
use crate::runtime::initialization::InitializationResult;
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use kube_runtime::controller::Config as ControllerSettings;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher::Config as WatcherConfig;
use kube_runtime::Controller;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Run every controller until a shutdown signal arrives
pub async fn run_watch_loop(init: InitializationResult) -> Result<()> {
    let InitializationResult {
        client,
        controller_config,
        reconcilers,
        server_state,
    } = init;
    let namespace = controller_config.watch_namespace.as_deref();
    let concurrency = controller_config.reconcile_concurrency;

    info!(
        "Starting controllers (namespace: {}, concurrency: {}, ready: {})",
        namespace.unwrap_or("*"),
        concurrency,
        server_state.is_ready()
    );

    let controllers: Vec<ControllerFuture> = vec![
        build_trillian_controller(&client, namespace, reconcilers.trillian, concurrency),
        build_ctlog_controller(&client, namespace, reconcilers.ctlog, concurrency),
        build_rekor_controller(&client, namespace, reconcilers.rekor, concurrency),
        build_tuf_controller(&client, namespace, reconcilers.tuf, concurrency),
        build_tsa_controller(&client, namespace, reconcilers.tsa, concurrency),
    ];

    futures::future::join_all(controllers).await;
    info!("Controllers stopped, shutting down");
    Ok(())
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Controller for `K` that also wakes on its Deployments and Services
fn base_controller<K>(client: &Client, namespace: Option<&str>) -> Controller<K>
where
    K: ManagedResource + Resource<Scope = NamespaceResourceScope>,
{
    Controller::new(api::<K>(client, namespace), watcher_config())
        .owns(api::<Deployment>(client, namespace), watcher_config())
        .owns(api::<Service>(client, namespace), watcher_config())
}

fn run<K>(controller: Controller<K>, reconciler: Arc<Reconciler<K>>, concurrency: u16) -> ControllerFuture
where
    K: ManagedResource + Resource<Scope = NamespaceResourceScope>,
{
    info!("- {} controller", K::kind(&()));
    Box::pin(
        controller
            .with_config(ControllerSettings::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile::<K>, handle_reconciliation_error::<K>, reconciler)
            .for_each(log_reconcile_result(K::COMPONENT)),
    )
}

fn build_trillian_controller(
    client: &Client,
    namespace: Option<&str>,
    reconciler: Arc<Reconciler<Trillian>>,
    concurrency: u16,
) -> ControllerFuture {
    let controller = base_controller::<Trillian>(client, namespace)
        .owns(api::<Secret>(client, namespace), watcher_config())
        .owns(api::<PersistentVolumeClaim>(client, namespace), watcher_config());
    run(controller, reconciler, concurrency)
}

fn build_ctlog_controller(
    client: &Client,
    namespace: Option<&str>,
    reconciler: Arc<Reconciler<CTlog>>,
    concurrency: u16,
) -> ControllerFuture {
    let controller = base_controller::<CTlog>(client, namespace)
        .owns(api::<Secret>(client, namespace), watcher_config());
    let store = controller.store();
    // Fulcio roots are discovered by label, so labelled Secrets wake every CTlog beside them
    let controller = controller.watches(
        api::<Secret>(client, namespace),
        watcher_config().labels(&trust_label(FULCIO_CERT_FILE)),
        move |secret: Secret| instances_in_namespace(&store, secret.metadata.namespace.as_deref()),
    );
    run(controller, reconciler, concurrency)
}

fn build_rekor_controller(
    client: &Client,
    namespace: Option<&str>,
    reconciler: Arc<Reconciler<Rekor>>,
    concurrency: u16,
) -> ControllerFuture {
    let controller = base_controller::<Rekor>(client, namespace)
        .owns(api::<Secret>(client, namespace), watcher_config())
        .owns(api::<PersistentVolumeClaim>(client, namespace), watcher_config());
    run(controller, reconciler, concurrency)
}

fn build_tuf_controller(
    client: &Client,
    namespace: Option<&str>,
    reconciler: Arc<Reconciler<Tuf>>,
    concurrency: u16,
) -> ControllerFuture {
    let controller = base_controller::<Tuf>(client, namespace)
        .owns(api::<PersistentVolumeClaim>(client, namespace), watcher_config())
        .owns(api::<Job>(client, namespace), watcher_config());
    let store = controller.store();
    let controller = controller.watches(
        api::<Secret>(client, namespace),
        watcher_config(),
        move |secret: Secret| {
            if has_trust_label(&secret) {
                instances_in_namespace(&store, secret.metadata.namespace.as_deref())
            } else {
                Vec::new()
            }
        },
    );
    run(controller, reconciler, concurrency)
}

fn build_tsa_controller(
    client: &Client,
    namespace: Option<&str>,
    reconciler: Arc<Reconciler<TimestampAuthority>>,
    concurrency: u16,
) -> ControllerFuture {
    let controller = base_controller::<TimestampAuthority>(client, namespace)
        .owns(api::<Secret>(client, namespace), watcher_config());
    run(controller, reconciler, concurrency)
}

/// Whether a Secret advertises any trust file
fn has_trust_label(secret: &Secret) -> bool {
    let prefix = format!("{LABEL_NAMESPACE}/");
    secret
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.keys().any(|key| key.starts_with(&prefix)))
}

fn instances_in_namespace<K>(store: &Store<K>, namespace: Option<&str>) -> Vec<ObjectRef<K>>
where
    K: ManagedResource,
{
    let Some(namespace) = namespace else {
        return Vec::new();
    };
    store
        .state()
        .iter()
        .filter(|instance| instance.meta().namespace.as_deref() == Some(namespace))
        .map(|instance| ObjectRef::from_obj(instance.as_ref()))
        .collect()
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => log_watch_error(controller_name, &e.to_string()),
        }
        std::future::ready(())
    }
}
