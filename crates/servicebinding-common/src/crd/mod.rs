//! Custom Resource Definitions for ServiceBinding
//!
//! This module contains the ServiceBinding CRD and the condition types
//! recorded on its status.

mod binding;
mod conditions;

pub use binding::{
    EnvMapping, LabelSelector, LabelSelectorRequirement, SecretReference, ServiceBinding,
    ServiceBindingSpec, ServiceBindingStatus, ServiceReference, WorkloadReference,
};
pub use conditions::{
    aggregate_ready, carry_transition_times, condition_types, reasons, Condition, ConditionManager,
    ConditionStatus,
};
