//! Shared fixtures for webhook tests

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{ApiResource, GroupVersionKind};
use mockall::mock;

use servicebinding_common::crd::{
    LabelSelector, ServiceBinding, ServiceBindingSpec, ServiceReference, WorkloadReference,
};
use servicebinding_common::events::{ControllerEvent, EventPublisher};
use servicebinding_common::kube_utils::build_api_resource;
use servicebinding_common::{ResourceMapper, Result};

mock! {
    pub Mapper {}

    #[async_trait]
    impl ResourceMapper for Mapper {
        async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource>;
    }
}

mock! {
    pub Events {}

    #[async_trait]
    impl EventPublisher for Events {
        async fn publish(&self, object: &ObjectReference, event: ControllerEvent);
    }
}

/// Mapper that lowercases the kind and appends an `s`
pub fn plural_mapper() -> MockMapper {
    let mut mapper = MockMapper::new();
    mapper
        .expect_resolve()
        .returning(|gvk| Ok(build_api_resource(gvk, &format!("{}s", gvk.kind.to_lowercase()))));
    mapper
}

/// A binding in `default` of the given service onto a workload named `app`
pub fn binding(name: &str, service: (&str, &str), workload: (&str, &str)) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        name,
        ServiceBindingSpec {
            service: ServiceReference {
                api_version: service.0.to_string(),
                kind: service.1.to_string(),
                name: "my-service".to_string(),
            },
            workload: WorkloadReference {
                api_version: workload.0.to_string(),
                kind: workload.1.to_string(),
                name: Some("app".to_string()),
                selector: None,
            },
            ..Default::default()
        },
    );
    binding.metadata.namespace = Some("default".to_string());
    binding.metadata.uid = Some(format!("uid-{name}"));
    binding
}

/// Replace the workload name with a single-label selector
pub fn with_selector(mut binding: ServiceBinding, key: &str, value: &str) -> ServiceBinding {
    binding.spec.workload.name = None;
    binding.spec.workload.selector = Some(LabelSelector {
        match_labels: [(key.to_string(), value.to_string())].into_iter().collect(),
        ..Default::default()
    });
    binding
}
