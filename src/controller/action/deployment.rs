//! # Await Deployment
//!
//! Holds a resource in `Initialize` until one of its Deployments is
//! available, tracking progress in a component sub-condition.

use super::{error_or_failed, Action, ActionContext, ActionError, Directive};
use crate::controller::client::get_opt;
use crate::controller::kubernetes::deployment_is_available;
use crate::crd::{namespace_of, Condition, ConditionStatus, ManagedResource, Phase};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

const WAITING_MESSAGE: &str = "Waiting for deployment to be ready";

pub struct AwaitDeployment<K> {
    name: String,
    deployment: &'static str,
    condition: &'static str,
    on_ready: Option<fn(&mut K)>,
    only_if: Option<fn(&K) -> bool>,
}

impl<K> std::fmt::Debug for AwaitDeployment<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwaitDeployment")
            .field("deployment", &self.deployment)
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}

impl<K> AwaitDeployment<K> {
    /// Wait for `deployment`, recording progress in the `condition` sub-condition
    pub fn new(deployment: &'static str, condition: &'static str) -> Self {
        Self {
            name: format!("wait for {deployment}"),
            deployment,
            condition,
            on_ready: None,
            only_if: None,
        }
    }

    /// Skip the wait for resources that do not run this deployment
    #[must_use]
    pub fn only_if(mut self, only_if: fn(&K) -> bool) -> Self {
        self.only_if = Some(only_if);
        self
    }

    /// Run `on_ready` on the working copy once the deployment is available
    #[must_use]
    pub fn on_ready(mut self, on_ready: fn(&mut K)) -> Self {
        self.on_ready = Some(on_ready);
        self
    }
}

#[async_trait]
impl<K: ManagedResource> Action<K> for AwaitDeployment<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, instance: &K) -> bool {
        instance.phase() == Some(Phase::Initialize)
            && !instance.is_condition_true(self.condition)
            && self.only_if.is_none_or(|only_if| only_if(instance))
    }

    async fn handle(&self, ctx: &ActionContext, instance: &mut K) -> Directive {
        let namespace = namespace_of(instance);
        let available = match get_opt::<Deployment>(ctx.client(), &namespace, self.deployment).await {
            Ok(deployment) => deployment.as_ref().is_some_and(deployment_is_available),
            Err(e) => return error_or_failed(instance, ActionError::Client(e)),
        };

        if available {
            instance.set_condition(
                Condition::new(self.condition, ConditionStatus::True, Phase::Ready)
                    .with_message(format!("{} is ready", self.deployment)),
            );
            if let Some(on_ready) = self.on_ready {
                on_ready(instance);
            }
            return Directive::StatusUpdate;
        }

        let waiting = Condition::new(self.condition, ConditionStatus::False, Phase::Initialize)
            .with_message(WAITING_MESSAGE);
        let unchanged = instance.find_condition(self.condition).is_some_and(|c| {
            c.status == waiting.status && c.reason == waiting.reason && c.message == waiting.message
        });
        if unchanged {
            debug!(deployment = self.deployment, "deployment not available yet");
            return ctx.wait_for_dependency();
        }

        instance.set_condition(waiting);
        Directive::StatusUpdate
    }
}
