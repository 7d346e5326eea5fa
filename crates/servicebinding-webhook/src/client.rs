//! Kubernetes client operations used by the webhook reconcilers and the
//! admission handlers

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use servicebinding_common::crd::ServiceBinding;
use servicebinding_common::{Error, Result, FIELD_MANAGER};

use crate::configuration::WebhookConfiguration;

/// Trait abstracting the API calls made by the webhook side of the operator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookKubeClient: Send + Sync {
    /// List bindings across all namespaces
    async fn list_bindings(&self) -> Result<Vec<ServiceBinding>>;

    /// List bindings in one namespace
    async fn list_bindings_in(&self, namespace: &str) -> Result<Vec<ServiceBinding>>;

    /// Replace a webhook configuration, conditioned on its resourceVersion
    async fn replace_configuration(
        &self,
        config: &WebhookConfiguration,
    ) -> Result<WebhookConfiguration>;
}

/// Production implementation backed by a kube `Client`
pub struct WebhookKubeClientImpl {
    client: Client,
}

impl WebhookKubeClientImpl {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

#[async_trait]
impl WebhookKubeClient for WebhookKubeClientImpl {
    async fn list_bindings(&self) -> Result<Vec<ServiceBinding>> {
        let api: Api<ServiceBinding> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, "ServiceBinding", "*", "list"))?;
        Ok(list.items)
    }

    async fn list_bindings_in(&self, namespace: &str) -> Result<Vec<ServiceBinding>> {
        let api: Api<ServiceBinding> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(e, "ServiceBinding", format!("{namespace}/*"), "list"))?;
        Ok(list.items)
    }

    async fn replace_configuration(
        &self,
        config: &WebhookConfiguration,
    ) -> Result<WebhookConfiguration> {
        let kind = config.kind();
        match config {
            WebhookConfiguration::Mutating(c) => {
                let name = c.name_any();
                let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
                api.replace(&name, &post_params(), c)
                    .await
                    .map(WebhookConfiguration::Mutating)
                    .map_err(|e| Error::from_kube(e, kind, &name, "update"))
            }
            WebhookConfiguration::Validating(c) => {
                let name = c.name_any();
                let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
                api.replace(&name, &post_params(), c)
                    .await
                    .map(WebhookConfiguration::Validating)
                    .map_err(|e| Error::from_kube(e, kind, &name, "update"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_carry_field_manager() {
        let params = post_params();
        assert_eq!(params.field_manager.as_deref(), Some(FIELD_MANAGER));
        assert!(!params.dry_run);
    }

    #[test]
    fn impl_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WebhookKubeClientImpl>();
    }
}
