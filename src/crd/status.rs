//! # Conditions and Phases
//!
//! Status conditions shared by every managed resource.
//!
//! A resource's lifecycle phase is a single `Ready` condition whose `reason`
//! is one of the [`Phase`] values. Components track their own progress with
//! additional sub-conditions (e.g. `ServerAvailable`) in the same list; their
//! reasons are free-form.

use crate::constants::READY;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle phase carried in the `reason` of a condition
///
/// The `Ready` condition moves along `Pending -> Creating -> Initialize -> Ready`.
/// `Failure` can be entered from any non-terminal phase and is left only
/// through the error-recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    Pending,
    Creating,
    Initialize,
    Ready,
    Failure,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Initialize => "Initialize",
            Phase::Ready => "Ready",
            Phase::Failure => "Failure",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a condition reason is not a lifecycle phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPhase(pub String);

impl fmt::Display for UnknownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown phase '{}'", self.0)
    }
}

impl std::error::Error for UnknownPhase {}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Phase::Pending),
            "Creating" => Ok(Phase::Creating),
            "Initialize" => Ok(Phase::Initialize),
            "Ready" => Ok(Phase::Ready),
            "Failure" => Ok(Phase::Failure),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

/// Status of a condition (True, False, Unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,
    /// Machine-readable reason; a [`Phase`] name on the `Ready` condition
    pub reason: String,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
    /// Last time `status` changed (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: ConditionStatus, reason: Phase) -> Self {
        Self {
            r#type: r#type.to_string(),
            status,
            reason: reason.as_str().to_string(),
            message: None,
            last_transition_time: None,
        }
    }

    /// `Ready` condition for the given phase; the status is `True` only for [`Phase::Ready`]
    pub fn ready(phase: Phase) -> Self {
        let status = if phase == Phase::Ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        Self::new(READY, status, phase)
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Replace the reason with one that is not a phase name
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// The reason as a lifecycle phase, `None` for free-form reasons
    pub fn phase(&self) -> Option<Phase> {
        self.reason.parse().ok()
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Insert or update a condition, keeping one entry per type
///
/// `last_transition_time` only moves when the status flips (or the condition
/// is new), so re-applying the same condition leaves it untouched.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    let now = || chrono::Utc::now().to_rfc3339();
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time =
                    condition.last_transition_time.take().or_else(|| Some(now()));
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
        }
        None => {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(now());
            }
            conditions.push(condition);
        }
    }
}

/// Capability implemented explicitly by every managed resource type
///
/// Generic actions only ever touch conditions through this trait.
pub trait ConditionsAware {
    fn conditions(&self) -> &[Condition];

    fn set_condition(&mut self, condition: Condition);

    fn find_condition(&self, r#type: &str) -> Option<&Condition> {
        find_condition(self.conditions(), r#type)
    }

    fn is_condition_true(&self, r#type: &str) -> bool {
        self.find_condition(r#type).is_some_and(Condition::is_true)
    }

    /// Current phase, `None` when the `Ready` condition has not been set yet
    fn phase(&self) -> Option<Phase> {
        self.find_condition(READY).and_then(Condition::phase)
    }
}
