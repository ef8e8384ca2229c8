//! # Initialization
//!
//! Operator bootstrap: rustls setup, tracing, metrics, the probe server,
//! the Kubernetes client and one reconciler per managed kind.

use crate::config::{load_config, ControllerConfig, ServerConfig};
use crate::constants::OPERATOR_NAME;
use crate::controller::action::{ActionContext, Pipeline};
use crate::controller::client::{ClusterClient, KubeClusterClient};
use crate::controller::components;
use crate::controller::events::{EventRecorder, KubeEventRecorder};
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::controller::tree::{GrpcTreeService, TreeService};
use crate::crd::{CTlog, ManagedResource, Rekor, TimestampAuthority, Trillian, Tuf};
use crate::observability;
use anyhow::{anyhow, Context, Result};
use kube::api::{Api, ListParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One engine per managed kind
#[derive(Debug, Clone)]
pub struct Reconcilers {
    pub trillian: Arc<Reconciler<Trillian>>,
    pub ctlog: Arc<Reconciler<CTlog>>,
    pub rekor: Arc<Reconciler<Rekor>>,
    pub tuf: Arc<Reconciler<Tuf>>,
    pub tsa: Arc<Reconciler<TimestampAuthority>>,
}

impl Reconcilers {
    /// Build the engines over a shared action context
    pub fn new(ctx: &ActionContext, trees: Arc<dyn TreeService>, config: &ControllerConfig) -> Self {
        fn engine<K: ManagedResource>(
            ctx: &ActionContext,
            pipeline: Pipeline<K>,
            config: &ControllerConfig,
        ) -> Arc<Reconciler<K>> {
            Arc::new(Reconciler::new(
                ctx.clone(),
                pipeline,
                config.allowed_restarts,
                config.reconcile_timeout(),
            ))
        }

        Self {
            trillian: engine(ctx, components::trillian::pipeline(), config),
            ctlog: engine(ctx, components::ctlog::pipeline(Arc::clone(&trees), config), config),
            rekor: engine(ctx, components::rekor::pipeline(trees, config), config),
            tuf: engine(ctx, components::tuf::pipeline(), config),
            tsa: engine(ctx, components::tsa::pipeline(), config),
        }
    }
}

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub controller_config: ControllerConfig,
    pub reconcilers: Reconcilers,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
}

/// Initialize the operator runtime
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before anything touches rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_provider| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "securesign_operator=info".into()),
        )
        .init();

    info!("Starting {} v{}", OPERATOR_NAME, env!("CARGO_PKG_VERSION"));

    let (controller_config, server_config) = load_config();
    info!(
        allowed_restarts = controller_config.allowed_restarts,
        reconcile_timeout_secs = controller_config.reconcile_timeout_secs,
        watch_namespace = controller_config.watch_namespace.as_deref().unwrap_or("*"),
        "Loaded controller configuration"
    );

    observability::metrics::register_metrics().context("Failed to register metrics")?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let recorder: Arc<dyn EventRecorder> =
        Arc::new(KubeEventRecorder::new(client.clone(), OPERATOR_NAME));
    let ctx = ActionContext::new(cluster, recorder, controller_config.dependency_requeue());
    let trees: Arc<dyn TreeService> = Arc::new(GrpcTreeService::new());
    let reconcilers = Reconcilers::new(&ctx, trees, &controller_config);

    let namespace = controller_config.watch_namespace.as_deref();
    summarize_existing::<Trillian>(&client, namespace).await;
    summarize_existing::<CTlog>(&client, namespace).await;
    summarize_existing::<Rekor>(&client, namespace).await;
    summarize_existing::<Tuf>(&client, namespace).await;
    summarize_existing::<TimestampAuthority>(&client, namespace).await;

    info!("Operator initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        controller_config,
        reconcilers,
        server_state,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = config.startup_timeout();
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow!("HTTP server failed to start"));
        }

        if server_state.is_ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(config.poll_interval()).await;
    }
}

/// Check the CRD is queryable and log a per-namespace summary of what exists
///
/// The controllers list everything again when their watches start, so this
/// only reports. A missing CRD is logged and tolerated.
async fn summarize_existing<K: ManagedResource>(client: &Client, namespace: Option<&str>)
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let _guard = tracing::info_span!(
        "controller.startup.summarize_existing",
        resource.kind = K::COMPONENT
    )
    .entered();

    match api.list(&ListParams::default()).await {
        Ok(list) => {
            let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for item in &list.items {
                by_namespace
                    .entry(crate::crd::namespace_of(item))
                    .or_default()
                    .push(crate::crd::name_of(item));
            }
            info!(
                "CRD is queryable, found {} existing {} resources in {} namespaces",
                list.items.len(),
                K::kind(&()),
                by_namespace.len()
            );
            for (ns, mut names) in by_namespace {
                names.sort();
                info!("  {}: {}", ns, summarize_names(&names));
            }
        }
        Err(e) => {
            error!("{} CRD is not queryable: {}. Is the CRD installed?", K::kind(&()), e);
            warn!("Continuing despite CRD queryability check failure - controller will retry");
        }
    }
}

fn summarize_names(names: &[String]) -> String {
    if names.len() <= 3 {
        names.join(", ")
    } else {
        format!("{}, ... ({} total)", names[..3].join(", "), names.len())
    }
}
