//! Kinds referenced by bindings
//!
//! The webhook configurations must intercept every workload kind a binding
//! projects into, and the trigger webhook additionally every provisioned
//! service kind. Direct Secret references need no interception.

use std::collections::HashSet;

use kube::api::GroupVersionKind;

use servicebinding_common::crd::ServiceBinding;

/// Distinct kinds in order of first sight
#[derive(Clone, Debug, Default)]
pub struct ObservedGvks {
    seen: HashSet<(String, String, String)>,
    gvks: Vec<GroupVersionKind>,
}

impl ObservedGvks {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind; returns false if it was already present
    pub fn insert(&mut self, gvk: GroupVersionKind) -> bool {
        let key = (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone());
        if !self.seen.insert(key) {
            return false;
        }
        self.gvks.push(gvk);
        true
    }

    /// Add the workload kind of every binding
    pub fn observe_workloads(&mut self, bindings: &[ServiceBinding]) -> &mut Self {
        for binding in bindings {
            self.insert(binding.spec.workload.gvk());
        }
        self
    }

    /// Add the service kind of every binding that does not bind a Secret
    /// directly
    pub fn observe_services(&mut self, bindings: &[ServiceBinding]) -> &mut Self {
        for binding in bindings.iter().filter(|b| !b.spec.service.is_direct_secret()) {
            self.insert(binding.spec.service.gvk());
        }
        self
    }

    /// Observed kinds
    pub fn as_slice(&self) -> &[GroupVersionKind] {
        &self.gvks
    }

    /// Number of distinct kinds
    pub fn len(&self) -> usize {
        self.gvks.len()
    }

    /// True if nothing was observed
    pub fn is_empty(&self) -> bool {
        self.gvks.is_empty()
    }
}

/// Kinds the projector webhook intercepts: workloads only
pub fn projector_gvks(bindings: &[ServiceBinding]) -> ObservedGvks {
    let mut observed = ObservedGvks::new();
    observed.observe_workloads(bindings);
    observed
}

/// Kinds the trigger webhook intercepts: workloads, then provisioned services
pub fn trigger_gvks(bindings: &[ServiceBinding]) -> ObservedGvks {
    let mut observed = ObservedGvks::new();
    observed.observe_workloads(bindings).observe_services(bindings);
    observed
}
