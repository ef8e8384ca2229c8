//! # Phase Transitions
//!
//! The only actions that move the `Ready` condition along the happy path:
//! `∅ → Pending → Creating → Initialize → Ready`.

use super::{Action, ActionContext, Directive};
use crate::controller::events::reasons;
use crate::crd::{Condition, ManagedResource, Phase};
use async_trait::async_trait;
use kube::runtime::events::EventType;
use std::marker::PhantomData;

macro_rules! transition {
    ($(#[$doc:meta])* $name:ident, $label:literal, $from:expr, $to:expr) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name<K>(PhantomData<fn() -> K>);

        impl<K> Default for $name<K> {
            fn default() -> Self {
                Self(PhantomData)
            }
        }

        impl<K> $name<K> {
            pub fn new() -> Self {
                Self::default()
            }
        }

        #[async_trait]
        impl<K: ManagedResource> Action<K> for $name<K> {
            fn name(&self) -> &str {
                $label
            }

            fn can_handle(&self, instance: &K) -> bool {
                instance.phase() == $from
            }

            async fn handle(&self, ctx: &ActionContext, instance: &mut K) -> Directive {
                enter(ctx, instance, $to).await
            }
        }
    };
}

transition!(
    /// Initialises the `Ready` condition of a new resource
    ToPending,
    "move to Pending phase",
    None,
    Phase::Pending
);
transition!(ToCreating, "move to Creating phase", Some(Phase::Pending), Phase::Creating);
transition!(ToInitialize, "move to Initialize phase", Some(Phase::Creating), Phase::Initialize);
transition!(
    /// Marks the resource converged and refills its restart budget
    ToReady,
    "move to Ready phase",
    Some(Phase::Initialize),
    Phase::Ready
);

async fn enter<K: ManagedResource>(ctx: &ActionContext, instance: &mut K, to: Phase) -> Directive {
    instance.set_condition(Condition::ready(to));
    if to == Phase::Ready {
        instance.set_restarts(0);
        ctx.event(
            instance,
            EventType::Normal,
            reasons::READY,
            format!("{} is ready", K::COMPONENT),
        )
        .await;
    }
    Directive::StatusUpdate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::action::testing::{fixture, rekor};
    use crate::crd::{ConditionStatus, ConditionsAware, Rekor};

    #[test]
    fn test_each_transition_matches_only_its_source_phase() {
        let phases = [
            None,
            Some(Phase::Pending),
            Some(Phase::Creating),
            Some(Phase::Initialize),
            Some(Phase::Ready),
            Some(Phase::Failure),
        ];
        let matching = |action: &dyn Action<Rekor>| {
            phases
                .iter()
                .filter(|p| action.can_handle(&rekor(**p)))
                .copied()
                .collect::<Vec<_>>()
        };

        assert_eq!(matching(&ToPending::<Rekor>::new()), vec![None]);
        assert_eq!(matching(&ToCreating::<Rekor>::new()), vec![Some(Phase::Pending)]);
        assert_eq!(matching(&ToInitialize::<Rekor>::new()), vec![Some(Phase::Creating)]);
        assert_eq!(matching(&ToReady::<Rekor>::new()), vec![Some(Phase::Initialize)]);
    }

    #[tokio::test]
    async fn test_transition_sets_reason_and_requests_status_update() {
        let f = fixture();
        let mut instance = rekor(Some(Phase::Pending));

        let directive = ToCreating::<Rekor>::new().handle(&f.ctx, &mut instance).await;

        assert!(matches!(directive, Directive::StatusUpdate));
        assert_eq!(instance.phase(), Some(Phase::Creating));
        assert_eq!(
            instance.find_condition("Ready").map(|c| c.status),
            Some(ConditionStatus::False)
        );
    }

    #[tokio::test]
    async fn test_to_ready_resets_restarts_and_emits_event() {
        let f = fixture();
        let mut instance = rekor(Some(Phase::Initialize));
        instance.set_restarts(2);

        ToReady::<Rekor>::new().handle(&f.ctx, &mut instance).await;

        assert_eq!(instance.phase(), Some(Phase::Ready));
        assert!(instance.is_condition_true("Ready"));
        assert_eq!(instance.restarts(), 0);
        assert_eq!(f.recorder.reasons(), vec![reasons::READY]);
    }
}
