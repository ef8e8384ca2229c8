//! # Kubernetes Events
//!
//! Trait-based abstraction over `kube::runtime::events::Recorder`, so actions
//! can emit Events visible through `kubectl describe` and tests can assert on
//! them.
//!
//! Events are fire-and-forget: a failed publish is logged and never reaches
//! the caller.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use std::sync::Mutex;
use tracing::warn;

/// Well-known event reasons
pub mod reasons {
    /// Resource converged
    pub const READY: &str = "Ready";
    /// Error recovery reset the resource to `Pending`
    pub const RESTARTED: &str = "Restarted";
    /// Error recovery budget exhausted
    pub const RESTART_THRESHOLD_REACHED: &str = "RestartThresholdReached";
    /// A child resource was created or updated
    pub const CHILD_CHANGED: &str = "ChildChanged";
    /// A Trillian tree was created
    pub const TREE_CREATED: &str = "TreeCreated";
    /// The signing key of a running server was replaced
    pub const SIGNER_CHANGED: &str = "SignerChanged";
    /// A trusted key published by the repository moved to another Secret
    pub const KEY_CHANGED: &str = "KeyChanged";
    /// A trusted key Secret disappeared
    pub const KEY_MISSING: &str = "KeyMissing";
    /// An operation failed and the resource moved to `Failure`
    pub const FAILED: &str = "Failed";
}

const RECONCILE_ACTION: &str = "Reconcile";

/// Publishes Kubernetes Events about managed resources
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

/// Reference to a managed resource suitable for [`EventRecorder::publish`]
pub fn object_reference<K: Resource<DynamicType = ()>>(resource: &K) -> ObjectReference {
    resource.object_ref(&())
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    /// `controller_name` appears as the reporting component of every Event
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: RECONCILE_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// An event captured by [`RecordingEventRecorder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

/// Keeps every published event in memory
#[derive(Debug, Default)]
pub struct RecordingEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEventRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let event = RecordedEvent {
            object: format!(
                "{}/{}",
                reference.namespace.as_deref().unwrap_or_default(),
                reference.name.as_deref().unwrap_or_default()
            ),
            warning: type_ == EventType::Warning,
            reason: reason.to_string(),
            note,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
