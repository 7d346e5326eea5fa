//! Status conditions for ServiceBinding
//!
//! A binding carries two dependent conditions, `ServiceAvailable` and
//! `WorkloadProjected`, plus a `Ready` condition that is always derived from
//! them by [`aggregate_ready`]. Stages write the dependents through a
//! [`ConditionManager`]; they never touch `Ready` directly.
//!
//! Every reconcile pass starts from `Unknown/Initializing` and re-derives
//! the conditions. [`carry_transition_times`] then restores the stored
//! timestamps of conditions whose status did not change, so an unchanged
//! binding produces an identical status.

use chrono::{DateTime, SubsecRound, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type names
pub mod condition_types {
    /// Aggregate readiness, derived from the dependents
    pub const READY: &str = "Ready";
    /// The service was resolved to a binding Secret
    pub const SERVICE_AVAILABLE: &str = "ServiceAvailable";
    /// The binding was projected into every resolved workload
    pub const WORKLOAD_PROJECTED: &str = "WorkloadProjected";

    /// Dependents of `Ready`, in the order they are consulted
    pub const DEPENDENTS: [&str; 2] = [SERVICE_AVAILABLE, WORKLOAD_PROJECTED];
}

/// Condition reason strings
pub mod reasons {
    /// Initial state of every condition before a stage has written it
    pub const INITIALIZING: &str = "Initializing";
    /// `Ready` when every dependent is True
    pub const READY: &str = "Ready";
    /// The binding Secret name was resolved
    pub const RESOLVED_BINDING_SECRET: &str = "ResolvedBindingSecret";
    /// The referenced service does not exist
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    /// The controller may not read the referenced service
    pub const SERVICE_FORBIDDEN: &str = "ServiceForbidden";
    /// The service exists but does not expose a binding Secret
    pub const SERVICE_MISSING_BINDING: &str = "ServiceMissingBinding";
    /// The referenced workload does not exist
    pub const WORKLOAD_NOT_FOUND: &str = "WorkloadNotFound";
    /// The controller may not read or update the workloads
    pub const WORKLOAD_FORBIDDEN: &str = "WorkloadForbidden";
    /// Every resolved workload carries the projection
    pub const WORKLOAD_PROJECTED: &str = "WorkloadProjected";
}

/// Tri-state condition status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false and will not recover without operator action
    False,
    /// Condition is not yet known
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (Ready, ServiceAvailable, WorkloadProjected)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status changed
    #[serde(
        rename = "lastTransitionTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now().trunc_subsecs(0)),
        }
    }

    /// True when status, reason and message all match
    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Compute `Ready` from the dependent conditions.
///
/// The first False dependent wins, then the first Unknown one; `Ready`
/// mirrors its reason and message. A missing dependent counts as Unknown.
pub fn aggregate_ready(dependents: &[Option<&Condition>]) -> (ConditionStatus, String, String) {
    let not_true = |wanted: ConditionStatus| {
        dependents.iter().find_map(|c| match c {
            Some(c) if c.status == wanted => Some((c.status, c.reason.clone(), c.message.clone())),
            None if wanted == ConditionStatus::Unknown => Some((
                ConditionStatus::Unknown,
                reasons::INITIALIZING.to_string(),
                String::new(),
            )),
            _ => None,
        })
    };

    not_true(ConditionStatus::False)
        .or_else(|| not_true(ConditionStatus::Unknown))
        .unwrap_or((ConditionStatus::True, reasons::READY.to_string(), String::new()))
}

/// Copy `lastTransitionTime` from `previous` onto every condition in
/// `current` whose status did not change.
pub fn carry_transition_times(previous: &[Condition], current: &mut [Condition]) {
    for condition in current.iter_mut() {
        if let Some(prev) = previous
            .iter()
            .find(|p| p.type_ == condition.type_ && p.status == condition.status)
        {
            condition.last_transition_time = prev.last_transition_time;
        }
    }
}

/// Writes conditions onto a status and keeps `Ready` in sync.
pub struct ConditionManager<'a> {
    conditions: &'a mut Vec<Condition>,
}

impl<'a> ConditionManager<'a> {
    /// Wrap a condition list
    pub fn new(conditions: &'a mut Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Restart the given dependents from `Unknown/Initializing` and
    /// initialise any managed condition that is missing. Conditions of other
    /// types keep their place.
    pub fn reset(&mut self, types: &[&str]) {
        self.conditions
            .retain(|c| !types.contains(&c.type_.as_str()) || c.type_ == condition_types::READY);
        for type_ in std::iter::once(condition_types::READY).chain(condition_types::DEPENDENTS) {
            if self.get(type_).is_none() {
                self.conditions.push(Condition::new(
                    type_,
                    ConditionStatus::Unknown,
                    reasons::INITIALIZING,
                    "",
                ));
            }
        }
        self.recompute_ready();
    }

    /// Look up a condition by type
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True if the condition is still in its initial state
    pub fn is_initializing(&self, type_: &str) -> bool {
        self.get(type_).map_or(true, |c| {
            c.status == ConditionStatus::Unknown && c.reason == reasons::INITIALIZING
        })
    }

    /// Mark a condition True; the message is cleared
    pub fn mark_true(&mut self, type_: &str, reason: &str) {
        self.set(Condition::new(type_, ConditionStatus::True, reason, ""));
    }

    /// Mark a condition False
    pub fn mark_false(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        self.set(Condition::new(type_, ConditionStatus::False, reason, message));
    }

    /// Mark a condition Unknown
    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        self.set(Condition::new(
            type_,
            ConditionStatus::Unknown,
            reason,
            message,
        ));
    }

    fn set(&mut self, condition: Condition) {
        let is_ready = condition.type_ == condition_types::READY;
        self.upsert(condition);
        if !is_ready {
            self.recompute_ready();
        }
    }

    fn upsert(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) if existing.same_state(&condition) => {}
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    fn recompute_ready(&mut self) {
        let dependents: Vec<Option<&Condition>> = condition_types::DEPENDENTS
            .iter()
            .map(|t| self.get(t))
            .collect();
        let (status, reason, message) = aggregate_ready(&dependents);
        self.upsert(Condition::new(
            condition_types::READY,
            status,
            reason,
            message,
        ));
    }
}
