//! Webhook configuration reconcilers
//!
//! Two reconcilers keep the admission webhooks pointed at exactly the kinds
//! bindings reference: the projector entry of the mutating configuration
//! (workload kinds) and the trigger entry of the validating configuration
//! (workload and service kinds). The configuration object only signals that
//! the rules should be recomputed; the bindings are the input.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use servicebinding_common::crd::ServiceBinding;
use servicebinding_common::events::{
    ControllerEvent, EventPublisher, KubeEventPublisher, NoopEventPublisher,
};
use servicebinding_common::{
    DiscoveryMapper, Error, ResourceMapper, PROJECTOR_WEBHOOK_NAME, TRIGGER_WEBHOOK_NAME,
};

use crate::client::{WebhookKubeClient, WebhookKubeClientImpl};
use crate::configuration::WebhookConfiguration;
use crate::gvk::{projector_gvks, trigger_gvks, ObservedGvks};
use crate::rules::{rules_equal, webhook_rules, PROJECTOR_OPERATIONS, TRIGGER_OPERATIONS};

/// Name the webhook reconcilers report Kubernetes events under
pub const CONTROLLER_NAME: &str = "servicebinding-webhook-controller";

/// Default name of the MutatingWebhookConfiguration kept in sync
pub const DEFAULT_MUTATING_CONFIGURATION: &str = "servicebinding-admission-projector";

/// Default name of the ValidatingWebhookConfiguration kept in sync
pub const DEFAULT_VALIDATING_CONFIGURATION: &str = "servicebinding-trigger";

/// Delay before retrying a failed reconcile
const RETRY_DELAY: Duration = Duration::from_secs(15);

/// Context shared by both webhook configuration reconcilers
pub struct WebhookContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn WebhookKubeClient>,
    /// Kind to REST resource resolution
    pub mapper: Arc<dyn ResourceMapper>,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Name of the MutatingWebhookConfiguration to maintain
    pub mutating_name: String,
    /// Name of the ValidatingWebhookConfiguration to maintain
    pub validating_name: String,
}

impl WebhookContext {
    /// Create a builder for constructing a context
    pub fn builder(client: Client) -> WebhookContextBuilder {
        WebhookContextBuilder::new(client)
    }

    /// Context over mock collaborators with the default configuration names
    pub fn for_testing(kube: Arc<dyn WebhookKubeClient>, mapper: Arc<dyn ResourceMapper>) -> Self {
        Self {
            kube,
            mapper,
            events: Arc::new(NoopEventPublisher),
            mutating_name: DEFAULT_MUTATING_CONFIGURATION.to_string(),
            validating_name: DEFAULT_VALIDATING_CONFIGURATION.to_string(),
        }
    }
}

/// Builder for [`WebhookContext`]
pub struct WebhookContextBuilder {
    client: Client,
    mapper: Option<Arc<dyn ResourceMapper>>,
    events: Option<Arc<dyn EventPublisher>>,
    mutating_name: String,
    validating_name: String,
}

impl WebhookContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            mapper: None,
            events: None,
            mutating_name: DEFAULT_MUTATING_CONFIGURATION.to_string(),
            validating_name: DEFAULT_VALIDATING_CONFIGURATION.to_string(),
        }
    }

    /// Share a mapper (and its cache) with other controllers
    pub fn mapper(mut self, mapper: Arc<dyn ResourceMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Name of the MutatingWebhookConfiguration to maintain
    pub fn mutating_name(mut self, name: impl Into<String>) -> Self {
        self.mutating_name = name.into();
        self
    }

    /// Name of the ValidatingWebhookConfiguration to maintain
    pub fn validating_name(mut self, name: impl Into<String>) -> Self {
        self.validating_name = name.into();
        self
    }

    /// Build the context, filling in production defaults
    pub fn build(self) -> WebhookContext {
        WebhookContext {
            kube: Arc::new(WebhookKubeClientImpl::new(self.client.clone())),
            mapper: self
                .mapper
                .unwrap_or_else(|| Arc::new(DiscoveryMapper::new(self.client.clone()))),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            mutating_name: self.mutating_name,
            validating_name: self.validating_name,
        }
    }
}

/// Reconcile the projector entry of the mutating configuration
#[instrument(skip(config, ctx), fields(configuration = %config.name_any()))]
pub async fn reconcile_projector(
    config: Arc<MutatingWebhookConfiguration>,
    ctx: Arc<WebhookContext>,
) -> Result<Action, Error> {
    if config.name_any() != ctx.mutating_name {
        debug!("not the managed configuration, ignoring");
        return Ok(Action::await_change());
    }
    sync_rules(
        WebhookConfiguration::Mutating((*config).clone()),
        &ctx,
        PROJECTOR_WEBHOOK_NAME,
        projector_gvks,
        PROJECTOR_OPERATIONS,
    )
    .await
}

/// Reconcile the trigger entry of the validating configuration
#[instrument(skip(config, ctx), fields(configuration = %config.name_any()))]
pub async fn reconcile_trigger(
    config: Arc<ValidatingWebhookConfiguration>,
    ctx: Arc<WebhookContext>,
) -> Result<Action, Error> {
    if config.name_any() != ctx.validating_name {
        debug!("not the managed configuration, ignoring");
        return Ok(Action::await_change());
    }
    sync_rules(
        WebhookConfiguration::Validating((*config).clone()),
        &ctx,
        TRIGGER_WEBHOOK_NAME,
        trigger_gvks,
        TRIGGER_OPERATIONS,
    )
    .await
}

/// Requeue a failed configuration after a fixed delay
pub fn error_policy<K: Resource>(config: Arc<K>, error: &Error, _ctx: Arc<WebhookContext>) -> Action {
    error!(?error, configuration = %config.name_any(), "webhook reconciliation failed");
    Action::requeue(RETRY_DELAY)
}

async fn sync_rules(
    mut config: WebhookConfiguration,
    ctx: &WebhookContext,
    webhook: &str,
    observe: fn(&[ServiceBinding]) -> ObservedGvks,
    operations: &[&str],
) -> Result<Action, Error> {
    let Some(stored) = config.rules(webhook) else {
        debug!(webhook, "webhook entry not present, nothing to do");
        return Ok(Action::await_change());
    };

    let bindings = ctx.kube.list_bindings().await?;
    let observed = observe(&bindings);
    let desired = webhook_rules(ctx.mapper.as_ref(), observed.as_slice(), operations).await?;

    if rules_equal(&stored, &desired) {
        debug!(webhook, "webhook rules up to date");
        return Ok(Action::await_change());
    }

    let rule_count = desired.len();
    config.set_rules(webhook, desired);
    let updated = ctx.kube.replace_configuration(&config).await?;
    info!(webhook, kinds = observed.len(), rules = rule_count, "updated webhook rules");

    let event = ControllerEvent::ConfigurationUpdated {
        kind: updated.kind().to_string(),
        name: updated.name().to_string(),
    };
    ctx.events.publish(&updated.object_ref(), event).await;

    Ok(Action::await_change())
}
