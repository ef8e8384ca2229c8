//! # Error Policy
//!
//! Error handling and backoff for the controller watch loop: reconciliation
//! errors get a per-resource Fibonacci backoff, watch stream errors are
//! classified and logged.

use crate::controller::reconciler::{BackoffState, Reconciler, ReconcilerError};
use crate::crd::{name_of, namespace_of, ManagedResource};
use crate::observability;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Requeue a failed pass with a Fibonacci backoff tracked per resource
///
/// The backoff state lives on the reconciler and is dropped again by the
/// next successful pass.
pub fn handle_reconciliation_error<K: ManagedResource>(
    obj: Arc<K>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler<K>>,
) -> Action {
    let name = name_of(obj.as_ref());
    let namespace = namespace_of(obj.as_ref());

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.kind = K::COMPONENT,
        resource.name = %name,
        resource.namespace = %namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    if error.is_retryable() {
        warn!("Reconciliation of {}/{} failed, will retry: {}", namespace, name, error);
    } else {
        error!("Reconciliation of {}/{} failed: {}", namespace, name, error);
    }
    observability::metrics::increment_reconciliation_errors(K::COMPONENT, error.kind());

    let resource_key = format!("{namespace}/{name}");
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(resource_key).or_insert_with(BackoffState::default);
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using minimum backoff", e);
            (crate::constants::DEFAULT_ERROR_BACKOFF_MIN_SECS, 0)
        }
    };

    info!(
        "Retrying in {}s (error count: {}, trigger source: error-backoff)",
        backoff_seconds, error_count
    );
    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}

/// Coarse classification of a watch stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// 401 - RBAC revoked or token expired
    Unauthorized,
    /// 410 - resource version expired; the watcher relists by itself
    Expired,
    /// 429 - API server storage (re)initializing
    Throttled,
    /// The object went away between event and lookup
    NotFound,
    Other,
}

pub fn classify_watch_error(error_string: &str) -> WatchErrorClass {
    if error_string.contains("401") || error_string.contains("Unauthorized") {
        WatchErrorClass::Unauthorized
    } else if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        WatchErrorClass::Expired
    } else if error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests")
    {
        WatchErrorClass::Throttled
    } else if error_string.contains("ObjectNotFound")
        || (error_string.contains("404") && error_string.contains("not found"))
    {
        WatchErrorClass::NotFound
    } else {
        WatchErrorClass::Other
    }
}

/// Log a controller stream error according to its class
pub fn log_watch_error(controller: &str, error_string: &str) {
    match classify_watch_error(error_string) {
        WatchErrorClass::Unauthorized => {
            error!(
                controller,
                "Watch authentication failed (401) - check the operator's ClusterRole and ServiceAccount: {}",
                error_string
            );
        }
        WatchErrorClass::Expired => {
            warn!(controller, "Watch resource version expired (410), watch will restart");
        }
        WatchErrorClass::Throttled => {
            warn!(controller, "API server storage reinitializing (429): {}", error_string);
        }
        WatchErrorClass::NotFound => {
            warn!(controller, "Resource not found (likely deleted), continuing watch");
        }
        WatchErrorClass::Other => {
            error!(controller, "Controller stream error: {}", error_string);
        }
    }
}
