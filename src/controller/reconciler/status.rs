//! # Status Persistence
//!
//! Writes the working status of a pass back to the API server.
//!
//! The write is skipped when the working status serializes identically to
//! the observed one, so a converged resource does not generate watch events.
//! Writes are conditional on the observed `resourceVersion`.

use crate::controller::client::{api_resource, ClientError, ClusterClient};
use crate::crd::{name_of, namespace_of, ManagedResource};
use serde_json::Value;
use tracing::debug;

/// Result of [`persist_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Written,
    Unchanged,
}

fn status_value<K: ManagedResource>(resource: &K) -> Result<Value, ClientError> {
    let mut value = serde_json::to_value(resource)?;
    Ok(value
        .as_object_mut()
        .and_then(|object| object.remove("status"))
        .unwrap_or(Value::Null))
}

/// Persist `working`'s status if it differs from `observed`'s
pub async fn persist_status<K: ManagedResource>(
    client: &dyn ClusterClient,
    observed: &K,
    working: &K,
) -> Result<StatusWrite, ClientError> {
    let before = status_value(observed)?;
    let after = status_value(working)?;
    if before == after {
        debug!("Skipping status update - status unchanged");
        return Ok(StatusWrite::Unchanged);
    }

    client
        .update_status(
            &api_resource::<K>(),
            &namespace_of(working),
            &name_of(working),
            observed.meta().resource_version.as_deref(),
            &after,
        )
        .await?;
    Ok(StatusWrite::Written)
}
