//! Shared harness for the reconciliation integration tests

mod components;
mod concurrency;
mod lifecycle;
mod recovery;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::ObjectMeta;
use k8s_openapi::ByteString;
use securesign_operator::config::ControllerConfig;
use securesign_operator::controller::action::{ActionContext, Pipeline};
use securesign_operator::controller::client::{
    api_resource, create_typed, get_typed, list_typed, to_dynamic, ClusterClient, InMemoryClient,
};
use securesign_operator::controller::events::RecordingEventRecorder;
use securesign_operator::controller::kubernetes::trust_label;
use securesign_operator::controller::reconciler::{PassOutcome, Reconciler};
use securesign_operator::controller::tree::{TreeError, TreeService};
use securesign_operator::crd::{ConditionsAware, ManagedResource, Phase};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NS: &str = "securesign";
pub const ALLOWED_RESTARTS: u32 = 3;
const MAX_PASSES: usize = 60;

/// Tree service answering from a script, then with a fixed id
pub struct ScriptedTrees {
    script: Mutex<VecDeque<Result<i64, TreeError>>>,
    fallback: i64,
    calls: AtomicUsize,
}

impl ScriptedTrees {
    pub fn fixed(tree_id: i64) -> Arc<Self> {
        Self::scripted(tree_id, Vec::new())
    }

    pub fn scripted(fallback: i64, script: Vec<Result<i64, TreeError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TreeService for ScriptedTrees {
    async fn create_tree(
        &self,
        _display_name: &str,
        _address: &str,
        _deadline: Duration,
    ) -> Result<i64, TreeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.fallback))
    }
}

pub struct Harness {
    pub client: Arc<InMemoryClient>,
    pub recorder: Arc<RecordingEventRecorder>,
    pub ctx: ActionContext,
    pub config: ControllerConfig,
}

impl Harness {
    pub fn new() -> Self {
        let client = Arc::new(InMemoryClient::new());
        let recorder = Arc::new(RecordingEventRecorder::new());
        let ctx = ActionContext::new(client.clone(), recorder.clone(), Duration::from_secs(10));
        Self {
            client,
            recorder,
            ctx,
            config: ControllerConfig {
                allowed_restarts: ALLOWED_RESTARTS,
                ..ControllerConfig::default()
            },
        }
    }

    pub fn reconciler<K: ManagedResource>(&self, pipeline: Pipeline<K>) -> Reconciler<K> {
        Reconciler::new(
            self.ctx.clone(),
            pipeline,
            self.config.allowed_restarts,
            Duration::from_secs(5),
        )
    }

    pub fn seed<K: ManagedResource>(&self, instance: &K) {
        self.client
            .seed(&api_resource::<K>(), to_dynamic(instance).unwrap());
    }

    pub async fn fetch<K: ManagedResource>(&self, name: &str) -> K {
        get_typed(self.client.as_ref(), NS, name).await.unwrap()
    }

    /// Overwrite the stored status, as another writer would
    pub async fn write_status<K: ManagedResource>(&self, name: &str, status: serde_json::Value) {
        self.client
            .update_status(&api_resource::<K>(), NS, name, None, &status)
            .await
            .unwrap();
    }

    /// Edit the stored object the way a user would, leaving the status alone
    pub async fn edit<K: ManagedResource>(&self, name: &str, edit: impl FnOnce(&mut K)) {
        let mut instance: K = self.fetch(name).await;
        edit(&mut instance);
        self.client
            .update(&api_resource::<K>(), NS, &to_dynamic(&instance).unwrap())
            .await
            .unwrap();
    }

    pub async fn delete_secret(&self, name: &str) {
        self.client
            .delete(&api_resource::<Secret>(), NS, name)
            .await
            .unwrap();
    }

    /// Run `passes` passes, ignoring their outcome, and return the final phase
    pub async fn run_passes<K: ManagedResource>(
        &self,
        reconciler: &Reconciler<K>,
        name: &str,
        passes: usize,
    ) -> Option<Phase> {
        for _ in 0..passes {
            let _ = reconciler.reconcile(NS, name).await;
            self.complete_workloads().await;
        }
        self.fetch::<K>(name).await.phase()
    }

    /// The Trillian log server Service the tree-backed kinds depend on
    pub async fn create_log_server_service(&self) {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("trillian-logserver".to_string()),
                namespace: Some(NS.to_string()),
                ..ObjectMeta::default()
            },
            ..Service::default()
        };
        create_typed(self.client.as_ref(), NS, &service).await.unwrap();
    }

    /// A Secret advertising `file` through its trust label
    pub async fn create_trust_secret(&self, name: &str, file: &str) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                labels: Some(BTreeMap::from([(trust_label(file), "value".to_string())])),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                "value".to_string(),
                ByteString(format!("-----BEGIN {name}-----").into_bytes()),
            )])),
            ..Secret::default()
        };
        create_typed(self.client.as_ref(), NS, &secret).await.unwrap();
    }

    /// Play the kubelet and job controller: every workload becomes ready
    pub async fn complete_workloads(&self) {
        let deployments: Vec<Deployment> = list_typed(self.client.as_ref(), NS, None).await.unwrap();
        for deployment in deployments {
            if deployment.status.is_some() {
                continue;
            }
            let name = deployment.metadata.name.unwrap_or_default();
            self.client
                .update_status(
                    &api_resource::<Deployment>(),
                    NS,
                    &name,
                    None,
                    &json!({
                        "readyReplicas": 1,
                        "conditions": [{"type": "Available", "status": "True"}]
                    }),
                )
                .await
                .unwrap();
        }

        let jobs: Vec<Job> = list_typed(self.client.as_ref(), NS, None).await.unwrap();
        for job in jobs {
            if job.status.is_some() {
                continue;
            }
            let name = job.metadata.name.unwrap_or_default();
            self.client
                .update_status(
                    &api_resource::<Job>(),
                    NS,
                    &name,
                    None,
                    &json!({"conditions": [{"type": "Complete", "status": "True"}]}),
                )
                .await
                .unwrap();
        }
    }

    /// Run passes until the resource is `Ready` and a pass finds nothing to do
    ///
    /// Returns the phases observed after each pass, without repeats.
    pub async fn converge<K: ManagedResource>(&self, reconciler: &Reconciler<K>, name: &str) -> Vec<Phase> {
        let mut phases: Vec<Phase> = Vec::new();
        if let Some(phase) = self.fetch::<K>(name).await.phase() {
            phases.push(phase);
        }

        for _ in 0..MAX_PASSES {
            let outcome = reconciler
                .reconcile(NS, name)
                .await
                .unwrap_or_else(|e| panic!("pass failed: {e}"));
            self.complete_workloads().await;

            let phase = self.fetch::<K>(name).await.phase();
            if let Some(phase) = phase {
                if phases.last() != Some(&phase) {
                    phases.push(phase);
                }
            }
            if phase == Some(Phase::Ready) && outcome == PassOutcome::Done {
                return phases;
            }
        }
        panic!("{name} did not converge within {MAX_PASSES} passes, phases: {phases:?}");
    }
}
