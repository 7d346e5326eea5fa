//! Controller runner - builds the controller futures the operator runs
//!
//! Each `build_*` function returns boxed futures that the caller composes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use servicebinding_common::crd::ServiceBinding;
use servicebinding_common::ResourceMapper;
use servicebinding_controller::{error_policy, reconcile, BindingContext};
use servicebinding_webhook::controller::{
    error_policy as webhook_error_policy, reconcile_projector, reconcile_trigger, WebhookContext,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be driven
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Watch only the object with the given name
fn named(name: &str) -> WatcherConfig {
    watcher_config().fields(&format!("metadata.name={name}"))
}

/// Build the ServiceBinding controller.
///
/// Besides binding events, reconciles are requested through `triggers` by
/// the admission trigger endpoint whenever a bound service or workload
/// changes.
pub fn build_binding_controllers(
    client: Client,
    mapper: Arc<dyn ResourceMapper>,
    triggers: mpsc::Receiver<ObjectRef<ServiceBinding>>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(BindingContext::builder(client.clone()).mapper(mapper).build());
    let bindings: Api<ServiceBinding> = Api::all(client);

    tracing::info!("- ServiceBinding controller");

    vec![Box::pin(
        Controller::new(bindings, watcher_config())
            .reconcile_on(ReceiverStream::new(triggers))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ServiceBinding")),
    )]
}

/// Build the webhook configuration controllers.
///
/// Each one watches its single named configuration and is re-triggered for
/// that name whenever any ServiceBinding changes.
pub fn build_webhook_controllers(
    client: Client,
    mapper: Arc<dyn ResourceMapper>,
    mutating_name: &str,
    validating_name: &str,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(
        WebhookContext::builder(client.clone())
            .mapper(mapper)
            .mutating_name(mutating_name)
            .validating_name(validating_name)
            .build(),
    );

    tracing::info!(configuration = %mutating_name, "- MutatingWebhookConfiguration controller");
    tracing::info!(configuration = %validating_name, "- ValidatingWebhookConfiguration controller");

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let projector_name = mutating_name.to_string();
    let projector = Controller::new(mutating, named(mutating_name))
        .watches(
            Api::<ServiceBinding>::all(client.clone()),
            watcher_config(),
            move |_| Some(ObjectRef::<MutatingWebhookConfiguration>::new(&projector_name)),
        )
        .shutdown_on_signal()
        .run(reconcile_projector, webhook_error_policy, ctx.clone())
        .for_each(log_reconcile_result("MutatingWebhookConfiguration"));

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let trigger_name = validating_name.to_string();
    let trigger = Controller::new(validating, named(validating_name))
        .watches(
            Api::<ServiceBinding>::all(client),
            watcher_config(),
            move |_| Some(ObjectRef::<ValidatingWebhookConfiguration>::new(&trigger_name)),
        )
        .shutdown_on_signal()
        .run(reconcile_trigger, webhook_error_policy, ctx)
        .for_each(log_reconcile_result("ValidatingWebhookConfiguration"));

    vec![Box::pin(projector), Box::pin(trigger)]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_watch_selects_one_object() {
        let config = named("servicebinding-trigger");
        assert_eq!(
            config.field_selector.as_deref(),
            Some("metadata.name=servicebinding-trigger")
        );
        assert_eq!(config.timeout, Some(WATCH_TIMEOUT_SECS));
    }
}
