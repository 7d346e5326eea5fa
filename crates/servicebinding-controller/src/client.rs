//! Kubernetes client operations used by the binding controller
//!
//! Workloads and provisioned services have arbitrary kinds, so they are
//! handled as `DynamicObject`s addressed by an `ApiResource`. Every error is
//! classified with [`Error::from_kube`] so callers can branch on not-found
//! and forbidden outcomes.

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use servicebinding_common::crd::ServiceBinding;
use servicebinding_common::{Error, Result, FIELD_MANAGER};

/// Trait abstracting the API calls made while reconciling a binding
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingKubeClient: Send + Sync {
    /// Get a namespaced object of any kind
    async fn get_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject>;

    /// List namespaced objects of any kind matching a label selector query
    async fn list_objects(
        &self,
        ar: &ApiResource,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Replace an object; the write is conditioned on its resourceVersion
    async fn update_object(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject>;

    /// Set a binding's finalizers, conditioned on its resourceVersion
    async fn patch_finalizers(
        &self,
        binding: &ServiceBinding,
        finalizers: &[String],
    ) -> Result<ServiceBinding>;

    /// Write a binding's status subresource, conditioned on its resourceVersion
    async fn update_status(&self, binding: &ServiceBinding) -> Result<ServiceBinding>;
}

/// Production implementation backed by a kube `Client`
pub struct BindingKubeClientImpl {
    client: Client,
}

impl BindingKubeClientImpl {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn bindings(&self, binding: &ServiceBinding) -> Api<ServiceBinding> {
        match binding.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Merge patch writing the whole status.
///
/// Every field is spelled out: an unset field becomes `null` so that the
/// merge removes what the server still stores.
fn status_patch(binding: &ServiceBinding) -> serde_json::Value {
    let status = binding.status.clone().unwrap_or_default();
    serde_json::json!({
        "metadata": {
            "resourceVersion": binding.resource_version(),
        },
        "status": {
            "observedGeneration": status.observed_generation,
            "conditions": status.conditions,
            "binding": status.binding,
        },
    })
}

#[async_trait]
impl BindingKubeClient for BindingKubeClientImpl {
    async fn get_object(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, ar);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, &ar.kind, qualified(namespace, name), "get"))
    }

    async fn list_objects(
        &self,
        ar: &ApiResource,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, ar);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::from_kube(e, &ar.kind, qualified(namespace, "*"), "list"))?;
        Ok(list.items)
    }

    async fn update_object(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &namespace, ar);
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        api.replace(&name, &params, obj)
            .await
            .map_err(|e| Error::from_kube(e, &ar.kind, qualified(&namespace, &name), "update"))
    }

    async fn patch_finalizers(
        &self,
        binding: &ServiceBinding,
        finalizers: &[String],
    ) -> Result<ServiceBinding> {
        let name = binding.name_any();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": binding.resource_version(),
            }
        });

        self.bindings(binding)
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, "ServiceBinding", &name, "patch"))
    }

    async fn update_status(&self, binding: &ServiceBinding) -> Result<ServiceBinding> {
        let name = binding.name_any();
        let patch = status_patch(binding);

        self.bindings(binding)
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, "ServiceBinding", &name, "update"))
    }
}
