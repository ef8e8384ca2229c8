//! # Ensure
//!
//! Create-or-update of a child object.
//!
//! The desired object only carries the fields the operator owns. The live
//! object is left alone when the desired object is a semantic subset of it
//! (fields the API server defaults or other controllers add are ignored),
//! so repeated passes over a converged resource issue no writes.

use super::{error_or_failed, failed, set_ready_message, Action, ActionContext, ActionError, Directive};
use crate::controller::client::{api_resource, to_dynamic, ClientError, ClusterClient};
use crate::controller::events::reasons;
use crate::crd::ManagedResource;
use crate::observability::metrics;
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::Resource;
use kube::runtime::events::EventType;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::{debug, info};

/// Result of [`ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
}

impl EnsureOutcome {
    pub fn changed(self) -> bool {
        self != EnsureOutcome::Unchanged
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnsureOutcome::Created => "created",
            EnsureOutcome::Updated => "updated",
            EnsureOutcome::Unchanged => "unchanged",
        }
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Whether every field set in `desired` has the same value in `live`
///
/// Unset desired values (null, empty strings, arrays and maps) match
/// anything. Arrays must have the same length and match element-wise.
pub fn json_contains(live: &Value, desired: &Value) -> bool {
    if is_unset(desired) {
        return true;
    }
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => desired
            .iter()
            .all(|(key, value)| live.get(key).map_or_else(|| is_unset(value), |l| json_contains(l, value))),
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len()
                && live.iter().zip(desired).all(|(l, d)| json_contains(l, d))
        }
        (live, desired) => live == desired,
    }
}

/// Overlay `patch` onto `target`; maps merge recursively, everything else is replaced
pub fn json_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) => json_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Bring the live object in line with `desired`
///
/// `desired` must carry its name and namespace. Write conflicts surface as
/// [`ClientError::Conflict`] and are safe to retry.
pub async fn ensure<C>(client: &dyn ClusterClient, desired: &C) -> Result<EnsureOutcome, ClientError>
where
    C: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let meta = desired.meta();
    let (Some(name), Some(namespace)) = (meta.name.as_deref(), meta.namespace.as_deref()) else {
        return Err(ClientError::Invalid(format!(
            "{} without name or namespace",
            C::kind(&())
        )));
    };
    let resource = api_resource::<C>();
    let desired_object = to_dynamic(desired)?;

    let live = match client.get(&resource, namespace, name).await {
        Ok(live) => live,
        Err(e) if e.is_not_found() => {
            client.create(&resource, namespace, &desired_object).await?;
            return Ok(EnsureOutcome::Created);
        }
        Err(e) => return Err(e),
    };

    let desired_value = serde_json::to_value(&desired_object)?;
    let mut merged = serde_json::to_value(&live)?;
    if json_contains(&merged, &desired_value) {
        return Ok(EnsureOutcome::Unchanged);
    }

    json_merge(&mut merged, &desired_value);
    let mut object: DynamicObject = serde_json::from_value(merged)?;
    object.metadata.resource_version = live.metadata.resource_version.clone();
    client.update(&resource, namespace, &object).await?;
    Ok(EnsureOutcome::Updated)
}

type BuildFn<K, C> = dyn Fn(&K) -> Result<Option<C>, ActionError> + Send + Sync;
type RecordFn<K, C> = fn(&mut K, &C) -> bool;

/// Action that keeps one child object in line with a builder
///
/// The builder returns `None` when the child is not wanted for the current
/// spec. The child gets the instance as controller owner. `record` copies
/// references to the child into the status and reports whether it changed
/// anything.
pub struct EnsureChild<K, C> {
    name: String,
    when: fn(&K) -> bool,
    build: Box<BuildFn<K, C>>,
    record: Option<RecordFn<K, C>>,
    _child: PhantomData<fn() -> C>,
}

impl<K, C> std::fmt::Debug for EnsureChild<K, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsureChild")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<K: ManagedResource, C> EnsureChild<K, C> {
    pub fn new(
        name: impl Into<String>,
        when: fn(&K) -> bool,
        build: impl Fn(&K) -> Result<Option<C>, ActionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            when,
            build: Box::new(build),
            record: None,
            _child: PhantomData,
        }
    }

    #[must_use]
    pub fn recording(mut self, record: RecordFn<K, C>) -> Self {
        self.record = Some(record);
        self
    }
}

#[async_trait]
impl<K, C> Action<K> for EnsureChild<K, C>
where
    K: ManagedResource,
    C: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, instance: &K) -> bool {
        (self.when)(instance)
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut K) -> Directive {
        let mut desired = match (self.build)(instance) {
            Ok(Some(desired)) => desired,
            Ok(None) => return Directive::Continue,
            Err(e) => return failed(instance, e),
        };
        if let Some(owner) = instance.controller_owner_ref(&()) {
            desired.meta_mut().owner_references = Some(vec![owner]);
        }
        let kind = C::kind(&()).to_string();
        let child = desired.meta().name.clone().unwrap_or_default();

        let outcome = match ensure(ctx.client(), &desired).await {
            Ok(outcome) => outcome,
            Err(e) => return error_or_failed(instance, ActionError::Client(e)),
        };
        metrics::increment_child_writes(K::COMPONENT, &kind, outcome.as_str());
        let recorded = self.record.is_some_and(|record| record(instance, &desired));

        if outcome.changed() {
            let message = format!("{kind} {child} {}", outcome.as_str());
            info!("{}", message);
            set_ready_message(instance, message.clone());
            ctx.event(instance, EventType::Normal, reasons::CHILD_CHANGED, message)
                .await;
            Directive::StatusUpdate
        } else if recorded {
            Directive::StatusUpdate
        } else {
            debug!(kind = %kind, child = %child, "child up to date");
            Directive::Continue
        }
    }
}
