//! Binding reconciliation stages
//!
//! A pass runs the [`Stage`]s in order over a working copy of the binding.
//! Stages record their outcome as conditions on that copy and hand the
//! resolved and projected workloads to each other through a pass-local
//! [`PipelineState`]. Nothing is persisted on the binding besides its status.
//!
//! While a binding is being deleted only the stages flagged
//! [`Stage::runs_on_delete`] execute, and projection turns into unprojection.

use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use servicebinding_common::crd::{
    condition_types, reasons, ConditionManager, SecretReference, ServiceBinding,
    ServiceBindingStatus,
};
use servicebinding_common::{ResourceMapper, Result};

use crate::client::BindingKubeClient;
use crate::projector::Projector;
use crate::resolver::{
    resolve_service, resolve_workloads, AccessScope, ServiceResolution, WorkloadResolution,
};

/// Whether the binding is live or waiting on its finalizer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// No deletion timestamp
    Live,
    /// Deletion requested; workloads must be unprojected
    Deleting,
}

impl LifecyclePhase {
    /// Phase of the given binding
    pub fn of(binding: &ServiceBinding) -> Self {
        if binding.is_deleting() {
            Self::Deleting
        } else {
            Self::Live
        }
    }
}

/// One step of a reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Resolve the service reference to a binding Secret
    ResolveBindingSecret,
    /// Resolve the workload reference to workload objects
    ResolveWorkloads,
    /// Project (or unproject) the binding into copies of the workloads
    ProjectBinding,
    /// Write back the workloads whose projection changed them
    PatchWorkloads,
}

impl Stage {
    /// Every stage, in execution order
    pub const ALL: [Stage; 4] = [
        Stage::ResolveBindingSecret,
        Stage::ResolveWorkloads,
        Stage::ProjectBinding,
        Stage::PatchWorkloads,
    ];

    /// Whether the stage still runs once deletion was requested
    pub fn runs_on_delete(self) -> bool {
        !matches!(self, Stage::ResolveBindingSecret)
    }

    /// Stage name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Stage::ResolveBindingSecret => "ResolveBindingSecret",
            Stage::ResolveWorkloads => "ResolveWorkloads",
            Stage::ProjectBinding => "ProjectBinding",
            Stage::PatchWorkloads => "PatchWorkloads",
        }
    }

    /// Condition type the stage writes
    pub fn condition_type(self) -> &'static str {
        match self {
            Stage::ResolveBindingSecret => condition_types::SERVICE_AVAILABLE,
            _ => condition_types::WORKLOAD_PROJECTED,
        }
    }

    /// Stages that run in the given phase, in order
    pub fn for_phase(phase: LifecyclePhase) -> impl Iterator<Item = Stage> {
        Self::ALL
            .into_iter()
            .filter(move |stage| phase == LifecyclePhase::Live || stage.runs_on_delete())
    }

    /// Condition types re-derived by a pass in the given phase
    pub fn conditions_for_phase(phase: LifecyclePhase) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = Vec::new();
        for stage in Self::for_phase(phase) {
            if !types.contains(&stage.condition_type()) {
                types.push(stage.condition_type());
            }
        }
        types
    }
}

/// Working data handed from one stage to the next
#[derive(Debug, Default)]
pub struct PipelineState {
    resource: Option<ApiResource>,
    workloads: Vec<DynamicObject>,
    projected: Vec<DynamicObject>,
}

/// Runs the stages of one reconcile pass
pub struct Pipeline<'a> {
    kube: &'a dyn BindingKubeClient,
    mapper: &'a dyn ResourceMapper,
    projector: &'a dyn Projector,
}

fn status_mut(binding: &mut ServiceBinding) -> &mut ServiceBindingStatus {
    binding.status.get_or_insert_with(Default::default)
}

impl<'a> Pipeline<'a> {
    /// Create a pipeline over the given collaborators
    pub fn new(
        kube: &'a dyn BindingKubeClient,
        mapper: &'a dyn ResourceMapper,
        projector: &'a dyn Projector,
    ) -> Self {
        Self {
            kube,
            mapper,
            projector,
        }
    }

    /// Run the stages of `phase` against `binding`.
    ///
    /// Conditions are written onto `binding.status`. The first error stops
    /// the pass; conditions recorded up to that point stay on the binding.
    pub async fn run(&self, binding: &mut ServiceBinding, phase: LifecyclePhase) -> Result<()> {
        let mut state = PipelineState::default();
        for stage in Stage::for_phase(phase) {
            debug!(stage = stage.name(), "Running stage");
            match stage {
                Stage::ResolveBindingSecret => self.resolve_binding_secret(binding).await?,
                Stage::ResolveWorkloads => self.resolve_workloads(binding, &mut state).await?,
                Stage::ProjectBinding => self.project_binding(binding, phase, &mut state)?,
                Stage::PatchWorkloads => self.patch_workloads(binding, &state).await?,
            }
        }
        Ok(())
    }

    async fn resolve_binding_secret(&self, binding: &mut ServiceBinding) -> Result<()> {
        let namespace = binding.namespace().unwrap_or_default();
        let resolution =
            resolve_service(self.kube, self.mapper, &namespace, &binding.spec.service).await?;

        let status = status_mut(binding);
        let mut conditions = ConditionManager::new(&mut status.conditions);
        match resolution {
            ServiceResolution::Resolved(name) => {
                conditions.mark_true(
                    condition_types::SERVICE_AVAILABLE,
                    reasons::RESOLVED_BINDING_SECRET,
                );
                status.binding = Some(SecretReference { name });
            }
            ServiceResolution::MissingBinding => {
                conditions.mark_unknown(
                    condition_types::SERVICE_AVAILABLE,
                    reasons::SERVICE_MISSING_BINDING,
                    "the service was found, but did not contain a binding secret",
                );
                status.binding = None;
            }
            // status.binding is kept; the service may only be briefly absent
            ServiceResolution::NotFound => conditions.mark_unknown(
                condition_types::SERVICE_AVAILABLE,
                reasons::SERVICE_NOT_FOUND,
                "the service was not found",
            ),
            ServiceResolution::Forbidden => conditions.mark_false(
                condition_types::SERVICE_AVAILABLE,
                reasons::SERVICE_FORBIDDEN,
                "the controller does not have permission to get the service",
            ),
        }
        Ok(())
    }

    async fn resolve_workloads(
        &self,
        binding: &mut ServiceBinding,
        state: &mut PipelineState,
    ) -> Result<()> {
        let namespace = binding.namespace().unwrap_or_default();
        let resolution =
            resolve_workloads(self.kube, self.mapper, &namespace, &binding.spec.workload).await?;

        let mut conditions = ConditionManager::new(&mut status_mut(binding).conditions);
        match resolution {
            WorkloadResolution::Resolved {
                resource,
                workloads,
            } => {
                state.resource = Some(resource);
                state.workloads = workloads;
            }
            WorkloadResolution::NotFound => conditions.mark_unknown(
                condition_types::WORKLOAD_PROJECTED,
                reasons::WORKLOAD_NOT_FOUND,
                "the workload was not found",
            ),
            WorkloadResolution::Forbidden(AccessScope::List) => conditions.mark_false(
                condition_types::WORKLOAD_PROJECTED,
                reasons::WORKLOAD_FORBIDDEN,
                "the controller does not have permission to list the workloads",
            ),
            WorkloadResolution::Forbidden(AccessScope::Single) => conditions.mark_false(
                condition_types::WORKLOAD_PROJECTED,
                reasons::WORKLOAD_FORBIDDEN,
                "the controller does not have permission to get the workload",
            ),
        }
        Ok(())
    }

    fn project_binding(
        &self,
        binding: &ServiceBinding,
        phase: LifecyclePhase,
        state: &mut PipelineState,
    ) -> Result<()> {
        state.projected = state
            .workloads
            .iter()
            .map(|workload| {
                let mut projected = workload.clone();
                match phase {
                    LifecyclePhase::Live => self.projector.project(binding, &mut projected)?,
                    LifecyclePhase::Deleting => {
                        self.projector.unproject(binding, &mut projected)?
                    }
                }
                Ok(projected)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    async fn patch_workloads(
        &self,
        binding: &mut ServiceBinding,
        state: &PipelineState,
    ) -> Result<()> {
        if state.workloads.len() != state.projected.len() {
            panic!(
                "workloads and projected workloads must have the same number of items ({} != {})",
                state.workloads.len(),
                state.projected.len()
            );
        }

        for (original, projected) in state.workloads.iter().zip(&state.projected) {
            if original.uid() != projected.uid()
                || original.resource_version() != projected.resource_version()
            {
                panic!(
                    "workload {} and its projection must have the same uid and resourceVersion",
                    original.name_any()
                );
            }
            if original == projected {
                continue;
            }
            let Some(resource) = state.resource.as_ref() else {
                unreachable!("workloads are only stored together with their resource");
            };

            let name = projected.name_any();
            match self.kube.update_object(resource, projected).await {
                Ok(_) => info!(workload = %name, kind = %resource.kind, "Updated workload"),
                Err(e) if e.is_not_found() => {
                    debug!(workload = %name, "Workload deleted before update, skipping");
                }
                Err(e) if e.is_forbidden() => {
                    warn!(workload = %name, error = %e, "Not allowed to update workload");
                    ConditionManager::new(&mut status_mut(binding).conditions).mark_false(
                        condition_types::WORKLOAD_PROJECTED,
                        reasons::WORKLOAD_FORBIDDEN,
                        "the controller does not have permission to update the workloads",
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let mut conditions = ConditionManager::new(&mut status_mut(binding).conditions);
        if conditions.is_initializing(condition_types::WORKLOAD_PROJECTED) {
            conditions.mark_true(
                condition_types::WORKLOAD_PROJECTED,
                reasons::WORKLOAD_PROJECTED,
            );
        }
        Ok(())
    }
}
