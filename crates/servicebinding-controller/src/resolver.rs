//! Reference resolution
//!
//! Turns a binding's service reference into a Secret name and its workload
//! reference into concrete workload objects. Resolution only reads cluster
//! state. Not-found and forbidden outcomes are returned as values because
//! the pipeline records them as conditions instead of failing the reconcile.

use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use tracing::debug;

use servicebinding_common::crd::{ServiceReference, WorkloadReference};
use servicebinding_common::document::Document;
use kube::core::SelectorExt;
use servicebinding_common::kube_utils::to_selector;
use servicebinding_common::{ResourceMapper, Result};

use crate::client::BindingKubeClient;

/// Outcome of resolving a service reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceResolution {
    /// The binding Secret name
    Resolved(String),
    /// The service exists but has not published a binding Secret
    MissingBinding,
    /// The service does not exist
    NotFound,
    /// The controller may not read the service
    Forbidden,
}

/// Which permission was missing when workloads could not be read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessScope {
    /// `get` on a named workload
    Single,
    /// `list` for a selector
    List,
}

/// Outcome of resolving a workload reference
#[derive(Clone, Debug, PartialEq)]
pub enum WorkloadResolution {
    /// Zero or more workloads, with the resource they were read through
    Resolved {
        /// REST resource of the workload kind
        resource: ApiResource,
        /// The workloads, in API server order
        workloads: Vec<DynamicObject>,
    },
    /// The named workload does not exist
    NotFound,
    /// The controller may not read the workloads
    Forbidden(AccessScope),
}

/// Resolve a service reference to the name of its binding Secret.
///
/// A direct Secret reference resolves to its own name without any API call;
/// one with an empty name names no Secret and counts as a missing binding.
/// Otherwise the referenced object is read and `status.binding.name` is
/// taken from it.
pub async fn resolve_service(
    kube: &dyn BindingKubeClient,
    mapper: &dyn ResourceMapper,
    namespace: &str,
    service: &ServiceReference,
) -> Result<ServiceResolution> {
    if service.is_direct_secret() {
        if service.name.is_empty() {
            return Ok(ServiceResolution::MissingBinding);
        }
        return Ok(ServiceResolution::Resolved(service.name.clone()));
    }

    let ar = mapper.resolve(&service.gvk()).await?;
    let obj = match kube.get_object(&ar, namespace, &service.name).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => return Ok(ServiceResolution::NotFound),
        Err(e) if e.is_forbidden() => return Ok(ServiceResolution::Forbidden),
        Err(e) => return Err(e),
    };

    match Document::of(&obj).binding_secret_name() {
        Some(name) => Ok(ServiceResolution::Resolved(name)),
        None => {
            debug!(
                service = %service.name,
                kind = %service.kind,
                "Service has not published a binding secret"
            );
            Ok(ServiceResolution::MissingBinding)
        }
    }
}

/// Resolve a workload reference to the workloads it names or selects.
///
/// A selector matching nothing resolves to an empty set. A reference with
/// neither name nor selector also resolves to an empty set. A selector the
/// API server could not evaluate is an error.
pub async fn resolve_workloads(
    kube: &dyn BindingKubeClient,
    mapper: &dyn ResourceMapper,
    namespace: &str,
    workload: &WorkloadReference,
) -> Result<WorkloadResolution> {
    let resource = mapper.resolve(&workload.gvk()).await?;

    if let Some(name) = workload.name.as_deref().filter(|n| !n.is_empty()) {
        return match kube.get_object(&resource, namespace, name).await {
            Ok(obj) => Ok(WorkloadResolution::Resolved {
                resource,
                workloads: vec![obj],
            }),
            Err(e) if e.is_not_found() => Ok(WorkloadResolution::NotFound),
            Err(e) if e.is_forbidden() => Ok(WorkloadResolution::Forbidden(AccessScope::Single)),
            Err(e) => Err(e),
        };
    }

    let Some(selector) = workload.selector.as_ref() else {
        return Ok(WorkloadResolution::Resolved {
            resource,
            workloads: Vec::new(),
        });
    };
    let selector = to_selector(selector)?;

    let listed = match kube
        .list_objects(&resource, namespace, &selector.to_string())
        .await
    {
        Ok(items) => items,
        Err(e) if e.is_forbidden() => return Ok(WorkloadResolution::Forbidden(AccessScope::List)),
        Err(e) => return Err(e),
    };

    let workloads: Vec<DynamicObject> = listed
        .into_iter()
        .filter(|w| selector.matches(w.labels()))
        .collect();
    debug!(
        kind = %workload.kind,
        count = workloads.len(),
        "Resolved workloads by selector"
    );

    Ok(WorkloadResolution::Resolved {
        resource,
        workloads,
    })
}
