//! Shared fixtures for controller tests

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use mockall::mock;

use servicebinding_common::crd::{
    LabelSelector, ServiceBinding, ServiceBindingSpec, ServiceReference, WorkloadReference,
};
use servicebinding_common::kube_utils::build_api_resource;
use servicebinding_common::events::{ControllerEvent, EventPublisher};
use servicebinding_common::{ResourceMapper, Result};

// Automocks of servicebinding-common traits only exist in that crate's own
// test build.
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

/// Mapper that answers every kind with the given plural
pub fn mapper_for(plural: &'static str) -> MockMapper {
    let mut mapper = MockMapper::new();
    mapper
        .expect_resolve()
        .returning(move |gvk| Ok(build_api_resource(gvk, plural)));
    mapper
}

/// A Deployment with one container and the given labels
pub fn deployment(name: &str, labels: &[(&str, &str)]) -> DynamicObject {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    DynamicObject {
        types: Some(TypeMeta {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            resource_version: Some("1".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {"labels": {"app": name}},
                    "spec": {
                        "containers": [{"name": "app", "image": "example/app:1.0"}]
                    }
                }
            }
        }),
    }
}

/// A Deployment reference selecting by one label
pub fn selector_workload(key: &str, value: &str) -> WorkloadReference {
    WorkloadReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: None,
        selector: Some(LabelSelector {
            match_labels: [(key.to_string(), value.to_string())].into_iter().collect(),
            ..Default::default()
        }),
    }
}

/// A binding of a direct Secret to the given workload reference
pub fn secret_binding(secret: &str, workload: WorkloadReference) -> ServiceBinding {
    let mut binding = ServiceBinding::new(
        "my-binding",
        ServiceBindingSpec {
            service: ServiceReference {
                api_version: "v1".to_string(),
                kind: "Secret".to_string(),
                name: secret.to_string(),
            },
            workload,
            ..Default::default()
        },
    );
    binding.metadata.namespace = Some("default".to_string());
    binding.metadata.uid = Some("binding-uid".to_string());
    binding.metadata.resource_version = Some("999".to_string());
    binding.metadata.generation = Some(1);
    binding
}

/// Stamp a deletion timestamp on the binding
pub fn mark_deleted(binding: &mut ServiceBinding) {
    binding.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
}
