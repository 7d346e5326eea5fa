//! Common types for ServiceBinding: the CRD, conditions, errors, and utilities
//! shared by the binding controller and the webhook reconcilers.

#![deny(missing_docs)]

pub mod crd;
pub mod document;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod mapper;
pub mod telemetry;

pub use error::Error;
pub use mapper::{DiscoveryMapper, ResourceMapper};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer placed on bindings so workloads are unprojected before deletion
pub const BINDING_FINALIZER: &str = "servicebinding.io/finalizer";

/// Field manager used for every write made by the operator
pub const FIELD_MANAGER: &str = "servicebinding-controller";

/// Name of the mutating webhook entry that projects bindings into workloads
pub const PROJECTOR_WEBHOOK_NAME: &str = "projector.servicebinding.io";

/// Name of the validating webhook entry that triggers binding reconciles
pub const TRIGGER_WEBHOOK_NAME: &str = "trigger.servicebinding.io";
