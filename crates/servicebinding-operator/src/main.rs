//! ServiceBinding operator - binds provisioned services to workloads

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::sync::mpsc;

use servicebinding_common::crd::ServiceBinding;
use servicebinding_common::telemetry::init_telemetry;
use servicebinding_common::{DiscoveryMapper, ResourceMapper};
use servicebinding_controller::PodTemplateProjector;
use servicebinding_webhook::client::WebhookKubeClientImpl;
use servicebinding_webhook::AdmissionState;

mod config;
mod controller_runner;
mod server;

use config::Config;
use controller_runner::{build_binding_controllers, build_webhook_controllers};

/// Capacity of the queue between the trigger endpoint and the binding controller
const TRIGGER_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install rustls crypto provider: {e:?}");
        std::process::exit(1);
    }

    let config = Config::parse();

    if config.crd {
        let crd = serde_yaml::to_string(&ServiceBinding::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(config.log_format)?;

    let client = Client::try_default().await?;
    let mapper: Arc<dyn ResourceMapper> = Arc::new(DiscoveryMapper::new(client.clone()));
    let (triggers, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_CAPACITY);

    tracing::info!("Starting ServiceBinding controllers...");
    let mut controllers = build_binding_controllers(client.clone(), mapper.clone(), trigger_rx);
    controllers.extend(build_webhook_controllers(
        client.clone(),
        mapper,
        &config.mutating_webhook_name,
        &config.validating_webhook_name,
    ));

    let server = async {
        if config.disable_webhook_server {
            tracing::info!("Admission server disabled");
            return std::future::pending::<anyhow::Result<()>>().await;
        }
        let state = Arc::new(AdmissionState {
            kube: Arc::new(WebhookKubeClientImpl::new(client.clone())),
            projector: Arc::new(PodTemplateProjector::new()),
            triggers: triggers.clone(),
        });
        server::start_server(config.webhook_addr, &config.tls_cert, &config.tls_key, state).await
    };

    tokio::select! {
        _ = futures::future::select_all(controllers) => {
            tracing::info!("Controller stopped");
        }
        result = server => {
            result?;
            tracing::info!("Admission server stopped");
        }
    }

    tracing::info!("ServiceBinding operator shutting down");
    Ok(())
}
