//! # Resolve Tree
//!
//! Keeps `status.treeID` pointing at the Trillian tree backing the log.
//!
//! A tree pinned in the spec is copied as-is. Otherwise exactly one tree is
//! created on the namespace's log server and its id is written to the
//! status, after which the action no longer matches; the id is reused for
//! the lifetime of the resource, across error recovery included.

use super::{error_or_failed, in_phase, Action, ActionContext, ActionError, Directive};
use crate::constants::{TRILLIAN_GRPC_PORT, TRILLIAN_LOGSERVER_NAME};
use crate::controller::client::get_opt;
use crate::controller::events::reasons;
use crate::controller::tree::TreeService;
use crate::crd::{namespace_of, Phase, TreeIdentified};
use crate::observability::metrics;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::events::EventType;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// gRPC address of the Trillian log server in `namespace`
pub fn log_server_address(namespace: &str) -> String {
    format!("{TRILLIAN_LOGSERVER_NAME}.{namespace}.svc:{TRILLIAN_GRPC_PORT}")
}

pub struct ResolveTree<K> {
    trees: Arc<dyn TreeService>,
    deadline: Duration,
    _kind: PhantomData<fn() -> K>,
}

impl<K> std::fmt::Debug for ResolveTree<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveTree")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<K> ResolveTree<K> {
    pub fn new(trees: Arc<dyn TreeService>, deadline: Duration) -> Self {
        Self {
            trees,
            deadline,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: TreeIdentified> Action<K> for ResolveTree<K> {
    fn name(&self) -> &str {
        "resolve treeID"
    }

    fn can_handle(&self, instance: &K) -> bool {
        in_phase(instance, &[Phase::Creating, Phase::Ready])
            && match (instance.spec_tree_id(), instance.status_tree_id()) {
                (_, None) => true,
                (Some(pinned), Some(current)) => pinned != current,
                (None, Some(_)) => false,
            }
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut K) -> Directive {
        if let Some(pinned) = instance.spec_tree_id() {
            instance.set_status_tree_id(pinned);
            return Directive::StatusUpdate;
        }

        let namespace = namespace_of(instance);
        match get_opt::<Service>(ctx.client(), &namespace, TRILLIAN_LOGSERVER_NAME).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("Waiting for the {} service", TRILLIAN_LOGSERVER_NAME);
                return ctx.wait_for_dependency();
            }
            Err(e) => return error_or_failed(instance, ActionError::Client(e)),
        }

        let display_name = format!("{}-tree", K::COMPONENT);
        let address = log_server_address(&namespace);
        match self
            .trees
            .create_tree(&display_name, &address, self.deadline)
            .await
        {
            Ok(tree_id) => {
                metrics::increment_trees_created(K::COMPONENT);
                instance.set_status_tree_id(tree_id);
                ctx.event(
                    instance,
                    EventType::Normal,
                    reasons::TREE_CREATED,
                    format!("New Trillian tree created: {tree_id}"),
                )
                .await;
                Directive::StatusUpdate
            }
            Err(e) => {
                warn!(address = %address, error = %e, "could not create trillian tree");
                error_or_failed(instance, ActionError::Tree(e))
            }
        }
    }
}
