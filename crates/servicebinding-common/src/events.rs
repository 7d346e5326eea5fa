//! Kubernetes Event recording for the ServiceBinding controllers.
//!
//! Every event records a write a controller made, so all of them are
//! `Normal`. Events are fire-and-forget: a failed publish is logged and never
//! fails the reconcile that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::BINDING_FINALIZER;

/// A write made by one of the controllers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// The binding finalizer was added to or removed from a binding
    FinalizerPatched,
    /// A binding's status subresource was written
    StatusUpdated,
    /// A webhook configuration's rules were rewritten
    ConfigurationUpdated {
        /// MutatingWebhookConfiguration or ValidatingWebhookConfiguration
        kind: String,
        /// Name of the configuration
        name: String,
    },
}

impl ControllerEvent {
    /// Shown in the REASON column of `kubectl get events`
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerEvent::FinalizerPatched => "FinalizerPatched",
            ControllerEvent::StatusUpdated => "StatusUpdated",
            ControllerEvent::ConfigurationUpdated { .. } => "Updated",
        }
    }

    /// Shown in the ACTION column of `kubectl get events`
    pub fn action(&self) -> &'static str {
        match self {
            ControllerEvent::FinalizerPatched => "Patch",
            ControllerEvent::StatusUpdated | ControllerEvent::ConfigurationUpdated { .. } => {
                "Update"
            }
        }
    }

    /// Human-readable message
    pub fn note(&self) -> String {
        match self {
            ControllerEvent::FinalizerPatched => {
                format!("Patched finalizer {BINDING_FINALIZER:?}")
            }
            ControllerEvent::StatusUpdated => "Updated status".to_string(),
            ControllerEvent::ConfigurationUpdated { kind, name } => {
                format!("Updated {kind} {name:?}")
            }
        }
    }
}

/// Publishes Kubernetes Events about objects the controllers write.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` on the given object
    async fn publish(&self, object: &ObjectReference, event: ControllerEvent);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, object: &ObjectReference, event: ControllerEvent) {
        let recorded = Event {
            type_: EventType::Normal,
            reason: event.reason().to_string(),
            note: Some(event.note()),
            action: event.action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&recorded, object).await {
            warn!(reason = event.reason(), error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _object: &ObjectReference, _event: ControllerEvent) {}
}
