//! # Reconciler
//!
//! The reconciliation engine shared by every managed kind.
//!
//! One trigger runs one pass:
//!
//! 1. Fetch the resource. A resource that no longer exists is a no-op.
//! 2. Skip resources annotated with `rhtas.redhat.com/pausedReconciliation: "true"`.
//! 3. Deep-copy it into a working copy.
//! 4. Run error recovery if it applies, otherwise walk the pipeline and run
//!    the first matching action. `Continue` moves on to the next action,
//!    any other directive ends the walk.
//! 5. Persist the working status at most once, conditional on the observed
//!    `resourceVersion`.
//!
//! Each pass runs under a deadline; a pass that exceeds it is abandoned
//! before its status write and reported as a retryable error.
//!
//! Passes for one resource are serialized by the kube-runtime controller;
//! distinct resources are reconciled concurrently.

pub mod status;

pub use status::{persist_status, StatusWrite};

use crate::constants::{
    DEFAULT_ERROR_BACKOFF_MAX_SECS, DEFAULT_ERROR_BACKOFF_MIN_SECS,
    PAUSED_RECONCILIATION_ANNOTATION,
};
use crate::controller::action::{Action, ActionContext, ActionError, ErrorRecovery, Halt, Pipeline};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::client::{get_typed, ClientError};
use crate::crd::{name_of, namespace_of, ManagedResource, Phase};
use crate::observability::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("failed to fetch resource: {0}")]
    Fetch(#[source] ClientError),

    #[error("status write conflict: {0}")]
    Conflict(#[source] ClientError),

    #[error("failed to persist status: {0}")]
    Persist(#[source] ClientError),

    #[error("action '{action}' failed: {source}")]
    Action {
        action: String,
        #[source]
        source: ActionError,
    },

    #[error("reconciliation pass exceeded {0:?}")]
    Timeout(Duration),
}

impl ReconcilerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcilerError::Conflict(_) | ReconcilerError::Timeout(_) => true,
            ReconcilerError::Fetch(e) | ReconcilerError::Persist(e) => e.is_retryable(),
            ReconcilerError::Action { source, .. } => source.is_retryable(),
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcilerError::Fetch(_) => "fetch",
            ReconcilerError::Conflict(_) => "conflict",
            ReconcilerError::Persist(_) => "persist",
            ReconcilerError::Action { .. } => "action",
            ReconcilerError::Timeout(_) => "timeout",
        }
    }
}

/// What the runtime should do after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Wait for the next watch event
    Done,
    /// Status was written; run the next step straight away
    RequeueNow,
    /// Check again after the delay
    RequeueAfter(Duration),
}

/// Per-resource error backoff kept by the error policy
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::new(
                DEFAULT_ERROR_BACKOFF_MIN_SECS,
                DEFAULT_ERROR_BACKOFF_MAX_SECS,
            ),
            error_count: 0,
        }
    }
}

impl BackoffState {
    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }
}

/// Reconciliation engine for one managed kind
pub struct Reconciler<K: ManagedResource> {
    pub ctx: ActionContext,
    recovery: ErrorRecovery<K>,
    pipeline: Pipeline<K>,
    pass_timeout: Duration,
    /// Error policy state, keyed by `namespace/name`
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl<K: ManagedResource> std::fmt::Debug for Reconciler<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("kind", &K::COMPONENT)
            .field("pipeline", &self.pipeline)
            .field("pass_timeout", &self.pass_timeout)
            .finish_non_exhaustive()
    }
}

/// Whether reconciliation of `resource` is paused by annotation
pub fn is_paused<K: ManagedResource>(resource: &K) -> bool {
    resource
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(PAUSED_RECONCILIATION_ANNOTATION))
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

impl<K: ManagedResource> Reconciler<K> {
    pub fn new(
        ctx: ActionContext,
        pipeline: Pipeline<K>,
        allowed_restarts: u32,
        pass_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            recovery: ErrorRecovery::new(allowed_restarts),
            pipeline,
            pass_timeout,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Pipeline<K> {
        &self.pipeline
    }

    /// Run one pass for `namespace/name` under the pass deadline
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<PassOutcome, ReconcilerError> {
        let span = tracing::info_span!(
            "controller.reconcile",
            resource.kind = K::COMPONENT,
            resource.namespace = namespace,
            resource.name = name
        );
        tokio::time::timeout(self.pass_timeout, self.run_pass(namespace, name))
            .instrument(span)
            .await
            .map_err(|_elapsed| ReconcilerError::Timeout(self.pass_timeout))?
    }

    async fn run_pass(&self, namespace: &str, name: &str) -> Result<PassOutcome, ReconcilerError> {
        let observed = match get_typed::<K>(self.ctx.client(), namespace, name).await {
            Ok(observed) => observed,
            Err(e) if e.is_not_found() => {
                debug!("resource no longer exists");
                return Ok(PassOutcome::Done);
            }
            Err(e) => return Err(ReconcilerError::Fetch(e)),
        };

        if is_paused(&observed) {
            info!("Reconciliation paused by annotation");
            return Ok(PassOutcome::Done);
        }

        let mut working = observed.clone();
        let Some((action, halt)) = self.evaluate(&mut working).await else {
            debug!("no action matched");
            return Ok(PassOutcome::Done);
        };

        match halt {
            Halt::StatusUpdate => match self.persist(&observed, &working).await? {
                StatusWrite::Written => Ok(PassOutcome::RequeueNow),
                StatusWrite::Unchanged => Ok(PassOutcome::Done),
            },
            Halt::Requeue(after) => {
                metrics::increment_requeues_total("dependency");
                Ok(PassOutcome::RequeueAfter(after))
            }
            Halt::Error(source) => Err(ReconcilerError::Action { action, source }),
            Halt::ErrorWithStatusUpdate(source) => {
                self.persist(&observed, &working).await?;
                Err(ReconcilerError::Action { action, source })
            }
        }
    }

    /// Run recovery or the first matching pipeline action on `working`
    async fn evaluate(&self, working: &mut K) -> Option<(String, Halt)> {
        let candidates = std::iter::once(&self.recovery as &dyn Action<K>).chain(
            self.pipeline.actions(),
        );

        for action in candidates {
            if !action.can_handle(working) {
                continue;
            }
            info!(action = action.name(), "Executing action");
            metrics::increment_actions_executed(K::COMPONENT, action.name());

            if let Some(halt) = action.handle(&self.ctx, working).await.halt() {
                return Some((action.name().to_string(), halt));
            }
        }
        None
    }

    async fn persist(&self, observed: &K, working: &K) -> Result<StatusWrite, ReconcilerError> {
        let write = match persist_status(self.ctx.client(), observed, working).await {
            Ok(write) => write,
            // deleted while the pass was running
            Err(e) if e.is_not_found() => return Ok(StatusWrite::Unchanged),
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "status write conflict, retrying with a fresh copy");
                return Err(ReconcilerError::Conflict(e));
            }
            Err(e) => return Err(ReconcilerError::Persist(e)),
        };

        let (before, after) = (observed.phase(), working.phase());
        if write == StatusWrite::Written && before != after {
            info!(
                from = before.map_or("None", Phase::as_str),
                to = after.map_or("None", Phase::as_str),
                "Phase changed"
            );
            if let Some(phase) = after {
                metrics::increment_phase_transitions(K::COMPONENT, phase.as_str());
            }
        }
        Ok(write)
    }
}

/// kube-runtime entry point: reconcile `resource` and map the outcome to a requeue policy
pub async fn reconcile<K: ManagedResource>(
    resource: Arc<K>,
    reconciler: Arc<Reconciler<K>>,
) -> Result<kube_runtime::controller::Action, ReconcilerError> {
    let namespace = namespace_of(resource.as_ref());
    let name = name_of(resource.as_ref());
    let start = Instant::now();
    metrics::increment_reconciliations(K::COMPONENT);

    let result = reconciler.reconcile(&namespace, &name).await;
    metrics::observe_reconciliation_duration(K::COMPONENT, start.elapsed().as_secs_f64());

    let outcome = result?;
    if let Ok(mut states) = reconciler.backoff_states.lock() {
        states.remove(&format!("{namespace}/{name}"));
    }

    Ok(match outcome {
        PassOutcome::Done => kube_runtime::controller::Action::await_change(),
        PassOutcome::RequeueNow => kube_runtime::controller::Action::requeue(Duration::ZERO),
        PassOutcome::RequeueAfter(after) => kube_runtime::controller::Action::requeue(after),
    })
}
