//! # Actions
//!
//! A reconciliation pass is an ordered [`Pipeline`] of [`Action`]s. Each
//! action declares, through a pure [`Action::can_handle`] predicate, whether
//! it applies to the resource's current state, and [`Action::handle`] reports
//! what the engine should do next as a [`Directive`].
//!
//! The engine runs the first action whose predicate matches. An action that
//! returns [`Directive::Continue`] lets the engine evaluate the next one;
//! every other directive ends the pass.
//!
//! ## Sub-modules
//!
//! - `transition` - the four phase-transition actions
//! - `recovery` - bounded rollback from `Failure` to `Pending`
//! - `ensure` - create-or-update of a child object
//! - `resolve_tree` - write-once Trillian tree id
//! - `deployment` - waits on child Deployments during `Initialize`

pub mod deployment;
pub mod ensure;
pub mod recovery;
pub mod resolve_tree;
pub mod transition;

pub use deployment::AwaitDeployment;
pub use ensure::{ensure, json_contains, json_merge, EnsureChild, EnsureOutcome};
pub use recovery::ErrorRecovery;
pub use resolve_tree::ResolveTree;
pub use transition::{ToCreating, ToInitialize, ToPending, ToReady};

use crate::constants::READY;
use crate::controller::client::{ClientError, ClusterClient};
use crate::controller::events::{object_reference, EventRecorder};
use crate::controller::keys::KeyError;
use crate::controller::tree::TreeError;
use crate::crd::{Condition, ManagedResource, Phase};
use async_trait::async_trait;
use kube::runtime::events::EventType;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while handling an action
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Keys(#[from] KeyError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ActionError::Client(e) => e.is_retryable(),
            ActionError::Tree(e) => e.is_retryable(),
            ActionError::Keys(_) | ActionError::Serialization(_) | ActionError::Failed(_) => false,
        }
    }
}

/// Outcome of [`Action::handle`]
#[derive(Debug)]
pub enum Directive {
    /// Evaluate the next action in this pass
    Continue,
    /// Persist the working status and end the pass
    StatusUpdate,
    /// End the pass and reconcile again after the delay
    Requeue(Duration),
    /// End the pass with an error; status is not written
    Error(ActionError),
    /// Persist the working status, then end the pass with an error
    ErrorWithStatusUpdate(ActionError),
}

impl Directive {
    /// Whether the engine should keep walking the pipeline
    pub fn is_continue(&self) -> bool {
        matches!(self, Directive::Continue)
    }

    /// The pass-ending form of this directive, `None` for [`Directive::Continue`]
    pub fn halt(self) -> Option<Halt> {
        match self {
            Directive::Continue => None,
            Directive::StatusUpdate => Some(Halt::StatusUpdate),
            Directive::Requeue(after) => Some(Halt::Requeue(after)),
            Directive::Error(e) => Some(Halt::Error(e)),
            Directive::ErrorWithStatusUpdate(e) => Some(Halt::ErrorWithStatusUpdate(e)),
        }
    }
}

/// A [`Directive`] that ends the pass
#[derive(Debug)]
pub enum Halt {
    StatusUpdate,
    Requeue(Duration),
    Error(ActionError),
    ErrorWithStatusUpdate(ActionError),
}

/// Shared collaborators handed to every action
#[derive(Clone)]
pub struct ActionContext {
    pub client: Arc<dyn ClusterClient>,
    pub recorder: Arc<dyn EventRecorder>,
    /// Delay before re-checking a dependency that is not ready yet
    pub dependency_requeue: Duration,
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("dependency_requeue", &self.dependency_requeue)
            .finish_non_exhaustive()
    }
}

impl ActionContext {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        recorder: Arc<dyn EventRecorder>,
        dependency_requeue: Duration,
    ) -> Self {
        Self {
            client,
            recorder,
            dependency_requeue,
        }
    }

    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    /// Publish an event about `instance`
    pub async fn event<K: ManagedResource>(
        &self,
        instance: &K,
        type_: EventType,
        reason: &str,
        note: impl Into<String>,
    ) {
        self.recorder
            .publish(&object_reference(instance), type_, reason, Some(note.into()))
            .await;
    }

    /// Requeue for a dependency that is not ready yet
    pub fn wait_for_dependency(&self) -> Directive {
        Directive::Requeue(self.dependency_requeue)
    }
}

/// One idempotent step of a reconciliation pipeline
#[async_trait]
pub trait Action<K: ManagedResource>: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    /// Whether this action applies to the current state
    ///
    /// Must be pure: it only inspects `instance`.
    fn can_handle(&self, instance: &K) -> bool;

    /// Drive the resource one step; may mutate the working copy of the status
    async fn handle(&self, ctx: &ActionContext, instance: &mut K) -> Directive;
}

/// Ordered list of actions walked once per pass
pub struct Pipeline<K: ManagedResource> {
    actions: Vec<Box<dyn Action<K>>>,
}

impl<K: ManagedResource> std::fmt::Debug for Pipeline<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<K: ManagedResource> Default for Pipeline<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ManagedResource> Pipeline<K> {
    pub fn new() -> Self {
        Self { actions: vec![] }
    }

    /// Append an action
    #[must_use]
    pub fn then(mut self, action: impl Action<K> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn actions(&self) -> impl Iterator<Item = &dyn Action<K>> {
        self.actions.iter().map(AsRef::as_ref)
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Whether the `Ready` condition is in one of `phases`
pub fn in_phase<K: ManagedResource>(instance: &K, phases: &[Phase]) -> bool {
    instance.phase().is_some_and(|p| phases.contains(&p))
}

/// Replace the message of the `Ready` condition, keeping its phase
pub fn set_ready_message<K: ManagedResource>(instance: &mut K, message: impl Into<String>) {
    if let Some(phase) = instance.phase() {
        instance.set_condition(Condition::ready(phase).with_message(message));
    }
}

/// Move to `Failure` with the error as message and request a status write
pub fn failed<K: ManagedResource>(instance: &mut K, error: ActionError) -> Directive {
    instance.set_condition(Condition::ready(Phase::Failure).with_message(error.to_string()));
    Directive::ErrorWithStatusUpdate(error)
}

/// Route an error: retryable ones end the pass untouched, others fail the resource
pub fn error_or_failed<K: ManagedResource>(instance: &mut K, error: ActionError) -> Directive {
    if error.is_retryable() {
        Directive::Error(error)
    } else {
        failed(instance, error)
    }
}

/// Message of the `Ready` condition, if any
pub fn ready_message<K: ManagedResource>(instance: &K) -> Option<&str> {
    instance
        .find_condition(READY)
        .and_then(|c| c.message.as_deref())
}
